use sluice_core::{ChannelId, ChunkId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("total number of channels is exhausted ({max})")]
    ChannelsExhausted { max: usize },

    #[error("total number of chunks in channel {channel} is exhausted ({max})")]
    ChunksExhausted { channel: ChannelId, max: usize },

    #[error("stale handle: channel {channel}, chunk {chunk:?}")]
    StaleHandle {
        channel: ChannelId,
        chunk: Option<ChunkId>,
    },

    #[error("usage of channel {channel}, chunk {chunk:?} is already zero")]
    UsageUnderflow {
        channel: ChannelId,
        chunk: Option<ChunkId>,
    },

    #[error("token index {index} out of range, chunk holds {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("chunk can not be serialized: {0}")]
    Encode(String),

    #[error("logic error: {0}")]
    Logic(String),
}
