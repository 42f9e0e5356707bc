//! Generation-tagged handles into the memory pool.
//!
//! Slot indices are recycled. The generation is bumped every time a slot is
//! released, so a handle kept across a release/reacquire cycle no longer
//! matches and is rejected instead of silently aliasing the new occupant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle to a channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub index: u32,
    pub generation: u32,
}

/// Handle to a chunk slot within its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}
