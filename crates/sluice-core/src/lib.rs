//! sluice-core: shared types, wire format, and configuration.
//! All other sluice crates depend on this one.

pub mod config;
pub mod data;
pub mod handle;
pub mod policy;
pub mod wire;

pub use data::{BufferSet, DataToken, MetaData, Segment, Timestamp};
pub use handle::{ChannelId, ChunkId};
pub use policy::{DataDistribution, DistributionMode, MemoryLocation, MinData, SlownessPolicy};
