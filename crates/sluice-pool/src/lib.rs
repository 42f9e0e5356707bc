//! sluice-pool: the process-wide channel/chunk memory pool.
//!
//! Producers append tokens to chunks of their own channel; consumers in the
//! same process read those chunks without copying. Every holder of a chunk
//! owns one usage unit and the chunk is cleared when the last unit is
//! released.

pub mod error;
pub mod lease;
pub mod pool;

pub use error::PoolError;
pub use lease::ChunkLease;
pub use pool::{CopyPolicy, MemoryPool, PoolStats};
