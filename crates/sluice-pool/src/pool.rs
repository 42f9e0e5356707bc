//! Channel/chunk memory pool.
//!
//! One pool-wide lock guards a bounded table of channels, each holding a
//! bounded table of chunks. Slots are allocated lazily up to the configured
//! capacity and recycled afterwards. Every slot carries a generation so a
//! handle that outlived its slot is rejected instead of aliasing the next
//! occupant.
//!
//! The lock is a `std::sync::Mutex`: it is never held across an `.await`
//! and it has to be usable from `Drop` (see `ChunkLease`).

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use sluice_core::config::PoolConfig;
use sluice_core::wire::{self, SerializedChunk};
use sluice_core::{BufferSet, ChannelId, ChunkId, DataToken, MetaData};

use crate::error::PoolError;
use crate::lease::ChunkLease;

/// How `write` stores a token's segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyPolicy {
    /// Keep borrowed segments as they are.
    #[default]
    Borrow,
    /// Copy borrowed segments first, so the token outlives the caller's
    /// buffers.
    Copy,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub channels_in_use: usize,
    pub chunks_in_use: usize,
    pub tokens: usize,
    pub serialized_cached: usize,
}

// ── Slots ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ChunkSlot {
    generation: u32,
    usage: u32,
    end_of_stream: bool,
    tokens: Vec<Arc<DataToken>>,
    serialized: Option<Arc<SerializedChunk>>,
}

impl ChunkSlot {
    fn release(&mut self) {
        self.tokens.clear();
        self.end_of_stream = false;
        self.serialized = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Default)]
struct ChannelSlot {
    generation: u32,
    usage: u32,
    chunks: Vec<ChunkSlot>,
}

impl ChannelSlot {
    /// Reusable only once no chunk is held any more.
    fn is_free(&self) -> bool {
        self.usage == 0 && self.chunks.iter().all(|c| c.usage == 0)
    }
}

struct PoolInner {
    config: PoolConfig,
    channels: Vec<ChannelSlot>,
}

impl PoolInner {
    fn channel(&mut self, ch: ChannelId) -> Result<&mut ChannelSlot, PoolError> {
        self.channels
            .get_mut(ch.index as usize)
            .filter(|slot| slot.generation == ch.generation)
            .ok_or(PoolError::StaleHandle {
                channel: ch,
                chunk: None,
            })
    }

    /// A live chunk: generation matches and somebody holds it.
    fn chunk(&mut self, ch: ChannelId, chunk: ChunkId) -> Result<&mut ChunkSlot, PoolError> {
        self.channel(ch)?
            .chunks
            .get_mut(chunk.index as usize)
            .filter(|slot| slot.generation == chunk.generation && slot.usage > 0)
            .ok_or(PoolError::StaleHandle {
                channel: ch,
                chunk: Some(chunk),
            })
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Cloneable handle to a memory pool.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<Mutex<PoolInner>>,
    /// Random per pool, so chunk references from another pool (or another
    /// process) can be told apart from our own.
    id: u64,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryPool {
    /// An isolated pool. Channels in the same process only see each other's
    /// chunks if they share a pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                config,
                channels: Vec::new(),
            })),
            id: rand::random(),
        }
    }

    /// The process-wide pool with default capacities.
    pub fn global() -> MemoryPool {
        static GLOBAL: OnceLock<MemoryPool> = OnceLock::new();
        GLOBAL
            .get_or_init(|| MemoryPool::new(PoolConfig::default()))
            .clone()
    }

    /// Identifies this pool in local chunk references.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Every operation leaves the tables consistent before it can panic,
        // so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Channels ──

    /// Claim a free channel slot. The caller holds one channel usage unit.
    pub fn register_channel(&self) -> Result<ChannelId, PoolError> {
        let mut inner = self.lock();
        let max = inner.config.max_channels;
        let index = match inner.channels.iter().position(ChannelSlot::is_free) {
            Some(i) => i,
            None if inner.channels.len() < max => {
                inner.channels.push(ChannelSlot::default());
                inner.channels.len() - 1
            }
            None => return Err(PoolError::ChannelsExhausted { max }),
        };
        let slot = &mut inner.channels[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.usage = 1;
        let id = ChannelId {
            index: index as u32,
            generation: slot.generation,
        };
        tracing::debug!(channel = %id, "channel registered");
        Ok(id)
    }

    pub fn unregister_channel(&self, ch: ChannelId) -> Result<(), PoolError> {
        self.decrement_channel_usage(ch).map(|_| ())
    }

    pub fn increment_channel_usage(&self, ch: ChannelId) -> Result<u32, PoolError> {
        let mut inner = self.lock();
        let slot = inner.channel(ch)?;
        if slot.usage == 0 {
            return Err(PoolError::StaleHandle {
                channel: ch,
                chunk: None,
            });
        }
        slot.usage += 1;
        Ok(slot.usage)
    }

    /// At zero every chunk nobody holds is cleared. Chunks still held stay
    /// intact until their last holder lets go; the slot is reusable after
    /// that.
    pub fn decrement_channel_usage(&self, ch: ChannelId) -> Result<u32, PoolError> {
        let mut inner = self.lock();
        let slot = inner.channel(ch)?;
        if slot.usage == 0 {
            return Err(PoolError::UsageUnderflow {
                channel: ch,
                chunk: None,
            });
        }
        slot.usage -= 1;
        if slot.usage == 0 {
            for chunk in slot.chunks.iter_mut().filter(|c| c.usage == 0) {
                chunk.tokens.clear();
                chunk.serialized = None;
            }
            let held = slot.chunks.iter().filter(|c| c.usage > 0).count();
            tracing::debug!(channel = %ch, held, "channel released");
        }
        Ok(slot.usage)
    }

    pub fn channel_usage(&self, ch: ChannelId) -> Result<u32, PoolError> {
        Ok(self.lock().channel(ch)?.usage)
    }

    // ── Chunks ──

    /// Claim a free chunk in `ch`. The new chunk has usage 1, owned by the
    /// caller.
    pub fn register_chunk(&self, ch: ChannelId) -> Result<ChunkId, PoolError> {
        let mut inner = self.lock();
        let max = inner.config.max_chunks_per_channel;
        let slot = inner.channel(ch)?;
        if slot.usage == 0 {
            return Err(PoolError::StaleHandle {
                channel: ch,
                chunk: None,
            });
        }
        let index = match slot.chunks.iter().position(|c| c.usage == 0) {
            Some(i) => i,
            None if slot.chunks.len() < max => {
                slot.chunks.push(ChunkSlot::default());
                slot.chunks.len() - 1
            }
            None => return Err(PoolError::ChunksExhausted { channel: ch, max }),
        };
        let chunk = &mut slot.chunks[index];
        chunk.usage = 1;
        chunk.tokens.clear();
        chunk.end_of_stream = false;
        chunk.serialized = None;
        Ok(ChunkId {
            index: index as u32,
            generation: chunk.generation,
        })
    }

    pub fn increment_chunk_usage(&self, ch: ChannelId, chunk: ChunkId) -> Result<u32, PoolError> {
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        slot.usage += 1;
        Ok(slot.usage)
    }

    /// Release one usage unit. Reaching zero clears the chunk and retires
    /// its handle.
    pub fn decrement_chunk_usage(&self, ch: ChannelId, chunk: ChunkId) -> Result<u32, PoolError> {
        let mut inner = self.lock();
        let slot = inner
            .channel(ch)?
            .chunks
            .get_mut(chunk.index as usize)
            .filter(|s| s.generation == chunk.generation)
            .ok_or(PoolError::StaleHandle {
                channel: ch,
                chunk: Some(chunk),
            })?;
        if slot.usage == 0 {
            return Err(PoolError::UsageUnderflow {
                channel: ch,
                chunk: Some(chunk),
            });
        }
        slot.usage -= 1;
        if slot.usage == 0 {
            slot.release();
            tracing::trace!(channel = %ch, chunk = %chunk, "freeing chunk memory");
        }
        Ok(slot.usage)
    }

    pub fn chunk_usage(&self, ch: ChannelId, chunk: ChunkId) -> Result<u32, PoolError> {
        Ok(self.lock().chunk(ch, chunk)?.usage)
    }

    /// Take one usage unit, released when the lease is dropped.
    pub fn lease(&self, ch: ChannelId, chunk: ChunkId) -> Result<ChunkLease, PoolError> {
        self.increment_chunk_usage(ch, chunk)?;
        Ok(ChunkLease::adopt(self.clone(), ch, chunk))
    }

    // ── Data ──

    pub fn write(
        &self,
        mut token: DataToken,
        ch: ChannelId,
        chunk: ChunkId,
        policy: CopyPolicy,
    ) -> Result<(), PoolError> {
        if policy == CopyPolicy::Copy {
            token.buffers.force_copy();
        }
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        slot.tokens.push(Arc::new(token));
        slot.serialized = None;
        Ok(())
    }

    /// Token `index` of the chunk. The chunk is left untouched.
    pub fn read(&self, index: usize, ch: ChannelId, chunk: ChunkId) -> Result<Arc<DataToken>, PoolError> {
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        slot.tokens
            .get(index)
            .cloned()
            .ok_or(PoolError::IndexOutOfRange {
                index,
                len: slot.tokens.len(),
            })
    }

    /// Append a whole token list, e.g. another channel's chunk.
    pub fn write_chunk(&self, tokens: &[Arc<DataToken>], ch: ChannelId, chunk: ChunkId) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        slot.tokens.extend(tokens.iter().cloned());
        slot.serialized = None;
        Ok(())
    }

    /// Expose every token of the chunk without copying.
    pub fn read_chunk(&self, ch: ChannelId, chunk: ChunkId) -> Result<Vec<Arc<DataToken>>, PoolError> {
        Ok(self.lock().chunk(ch, chunk)?.tokens.clone())
    }

    /// Append tokens given as separate, positionally aligned lists.
    pub fn write_parts(
        &self,
        buffers: Vec<BufferSet>,
        metas: Vec<MetaData>,
        ch: ChannelId,
        chunk: ChunkId,
    ) -> Result<(), PoolError> {
        if buffers.len() != metas.len() {
            return Err(PoolError::Logic(format!(
                "{} buffer sets but {} meta-data entries",
                buffers.len(),
                metas.len()
            )));
        }
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        slot.tokens.extend(
            buffers
                .into_iter()
                .zip(metas)
                .map(|(b, m)| Arc::new(DataToken::new(b, m))),
        );
        slot.serialized = None;
        Ok(())
    }

    /// Drop the chunk's tokens without touching its usage.
    pub fn clear_chunk_data(&self, ch: ChannelId, chunk: ChunkId) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        slot.tokens.clear();
        slot.serialized = None;
        Ok(())
    }

    /// Replace every token that still borrows producer memory with an owned
    /// copy. Needed before a chunk is handed to consumers that may outlive
    /// the producer's buffers.
    pub fn assure_all_data_is_copied(&self, ch: ChannelId, chunk: ChunkId) -> Result<usize, PoolError> {
        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        let mut copied = 0;
        for token in slot.tokens.iter_mut() {
            if token.buffers.contains_non_copies() {
                let mut owned = DataToken::clone(token);
                owned.buffers.force_copy();
                *token = Arc::new(owned);
                copied += 1;
            }
        }
        Ok(copied)
    }

    pub fn size(&self, ch: ChannelId, chunk: ChunkId) -> Result<usize, PoolError> {
        Ok(self.lock().chunk(ch, chunk)?.tokens.len())
    }

    pub fn set_end_of_stream(&self, ch: ChannelId, chunk: ChunkId, eos: bool) -> Result<(), PoolError> {
        self.lock().chunk(ch, chunk)?.end_of_stream = eos;
        Ok(())
    }

    pub fn is_end_of_stream(&self, ch: ChannelId, chunk: ChunkId) -> Result<bool, PoolError> {
        Ok(self.lock().chunk(ch, chunk)?.end_of_stream)
    }

    // ── Serialization cache ──

    /// Wire form of the chunk, built on first use and shared by every
    /// remote delivery until `clear_serialized` or the chunk is released.
    pub fn serialized(&self, ch: ChannelId, chunk: ChunkId) -> Result<Arc<SerializedChunk>, PoolError> {
        let tokens = {
            let mut inner = self.lock();
            let slot = inner.chunk(ch, chunk)?;
            if let Some(cached) = &slot.serialized {
                return Ok(cached.clone());
            }
            slot.tokens.clone()
        };

        // Encode outside the lock; large chunks take a while.
        let encoded = wire::encode_tokens(tokens.iter().map(Arc::as_ref))
            .map_err(|e| PoolError::Encode(e.to_string()))?;
        let encoded = Arc::new(encoded);

        let mut inner = self.lock();
        let slot = inner.chunk(ch, chunk)?;
        Ok(slot.serialized.get_or_insert(encoded).clone())
    }

    pub fn clear_serialized(&self, ch: ChannelId, chunk: ChunkId) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if let Ok(slot) = inner.chunk(ch, chunk) {
            slot.serialized = None;
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let mut stats = PoolStats::default();
        for channel in &inner.channels {
            if !channel.is_free() {
                stats.channels_in_use += 1;
            }
            for chunk in &channel.chunks {
                if chunk.usage > 0 {
                    stats.chunks_in_use += 1;
                }
                stats.tokens += chunk.tokens.len();
                stats.serialized_cached += usize::from(chunk.serialized.is_some());
            }
        }
        stats
    }
}
