//! RAII ownership of one chunk usage unit.

use sluice_core::{ChannelId, ChunkId};

use crate::error::PoolError;
use crate::pool::MemoryPool;

/// One usage unit of a chunk. Dropping the lease releases it.
///
/// Every hold a channel takes on a chunk (the producer until rotation, each
/// pending delivery, each queued entry) lives in one of these, so a
/// delivery that is abandoned halfway still gives the chunk back.
#[derive(Debug)]
pub struct ChunkLease {
    pool: MemoryPool,
    channel: ChannelId,
    chunk: ChunkId,
    armed: bool,
}

impl ChunkLease {
    /// Take over a unit the caller already counted, e.g. the one
    /// `register_chunk` hands out.
    pub fn adopt(pool: MemoryPool, channel: ChannelId, chunk: ChunkId) -> Self {
        Self {
            pool,
            channel,
            chunk,
            armed: true,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Another unit on the same chunk.
    pub fn try_clone(&self) -> Result<ChunkLease, PoolError> {
        self.pool.lease(self.channel, self.chunk)
    }

    /// Release now and report the outcome instead of logging it.
    pub fn release(mut self) -> Result<u32, PoolError> {
        self.armed = false;
        self.pool.decrement_chunk_usage(self.channel, self.chunk)
    }
}

impl Drop for ChunkLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.pool.decrement_chunk_usage(self.channel, self.chunk) {
            tracing::warn!(
                channel = %self.channel,
                chunk = %self.chunk,
                error = %e,
                "failed to release chunk lease"
            );
        }
    }
}
