//! Delivery tracking: outbound frames and the holds they carry.
//!
//! A remote delivery owns one usage unit of its chunk until the payload has
//! been written, and counts as an outstanding writer of the chunk's cached
//! serialization; the cache is dropped when the last writer finishes.
//! Local deliveries hold nothing here: the consumer record keeps their
//! unit until the consumer releases the chunk or goes away.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use sluice_core::wire::Frame;
use sluice_core::{ChannelId, ChunkId};
use sluice_pool::{ChunkLease, MemoryPool};

/// Outstanding remote writers per chunk.
#[derive(Clone, Default)]
pub struct WriterTracker {
    writers: Arc<DashMap<(ChannelId, ChunkId), usize>>,
}

impl WriterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more in-flight write of the chunk's serialization.
    pub fn register(&self, pool: &MemoryPool, channel: ChannelId, chunk: ChunkId) -> WriterGuard {
        *self.writers.entry((channel, chunk)).or_insert(0) += 1;
        WriterGuard {
            tracker: self.clone(),
            pool: pool.clone(),
            channel,
            chunk,
        }
    }

    /// In-flight writes of one chunk.
    pub fn outstanding(&self, channel: ChannelId, chunk: ChunkId) -> usize {
        self.writers.get(&(channel, chunk)).map(|n| *n).unwrap_or(0)
    }

    fn finish(&self, pool: &MemoryPool, channel: ChannelId, chunk: ChunkId) {
        if let Entry::Occupied(mut e) = self.writers.entry((channel, chunk)) {
            *e.get_mut() -= 1;
            if *e.get() == 0 {
                e.remove();
                if let Err(err) = pool.clear_serialized(channel, chunk) {
                    tracing::debug!(%channel, %chunk, error = %err, "serialization already gone");
                }
            }
        }
    }
}

/// One in-flight remote write. Dropping it marks the write finished.
pub struct WriterGuard {
    tracker: WriterTracker,
    pool: MemoryPool,
    channel: ChannelId,
    chunk: ChunkId,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.pool, self.channel, self.chunk);
    }
}

// ── Outbound frames ───────────────────────────────────────────────────────────

/// A frame queued on a connection's writer task. Whatever it holds is
/// released when it is dropped, written or not.
pub struct Outbound {
    pub frame: Frame,
    // Field order matters: the writer guard clears the serialization before
    // the lease gives up the chunk.
    _writer: Option<WriterGuard>,
    _lease: Option<ChunkLease>,
}

impl Outbound {
    /// A frame that holds nothing.
    pub fn control(frame: Frame) -> Self {
        Self {
            frame,
            _writer: None,
            _lease: None,
        }
    }

    /// Remote delivery: the unit is released once the payload is written.
    pub fn remote(frame: Frame, lease: ChunkLease, writer: WriterGuard) -> Self {
        Self {
            frame,
            _writer: Some(writer),
            _lease: Some(lease),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_core::config::PoolConfig;
    use sluice_core::{BufferSet, DataToken, MetaData};
    use sluice_pool::CopyPolicy;

    fn pool_with_chunk() -> (MemoryPool, ChannelId, ChunkId) {
        let pool = MemoryPool::new(PoolConfig::default());
        let ch = pool.register_channel().unwrap();
        let chunk = pool.register_chunk(ch).unwrap();
        let mut buffers = BufferSet::new();
        buffers.push_borrowed(Bytes::from_static(b"abc"));
        pool.write(DataToken::new(buffers, MetaData::default()), ch, chunk, CopyPolicy::Borrow)
            .unwrap();
        (pool, ch, chunk)
    }

    #[test]
    fn last_writer_clears_serialization() {
        let (pool, ch, chunk) = pool_with_chunk();
        let tracker = WriterTracker::new();
        let ser = pool.serialized(ch, chunk).unwrap();

        let a = Outbound::remote(ser.to_frame(), pool.lease(ch, chunk).unwrap(), tracker.register(&pool, ch, chunk));
        let b = Outbound::remote(ser.to_frame(), pool.lease(ch, chunk).unwrap(), tracker.register(&pool, ch, chunk));
        assert_eq!(tracker.outstanding(ch, chunk), 2);
        assert_eq!(pool.chunk_usage(ch, chunk).unwrap(), 3);

        drop(a);
        assert_eq!(pool.stats().serialized_cached, 1);
        assert_eq!(pool.chunk_usage(ch, chunk).unwrap(), 2);
        drop(b);
        assert_eq!(tracker.outstanding(ch, chunk), 0);
        assert_eq!(pool.stats().serialized_cached, 0);
        assert_eq!(pool.chunk_usage(ch, chunk).unwrap(), 1);
    }

    #[test]
    fn control_frames_hold_nothing() {
        let (pool, ch, chunk) = pool_with_chunk();
        drop(Outbound::control(Frame::EndOfStream));
        assert_eq!(pool.chunk_usage(ch, chunk).unwrap(), 1);
        assert_eq!(pool.stats().serialized_cached, 0);
    }
}
