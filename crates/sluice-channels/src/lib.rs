//! sluice-channels: output and input channels over TCP.
//!
//! An `OutputChannel` listens for consumers and distributes the chunks its
//! owner writes. An `InputChannel` connects to one or more output channels
//! and double-buffers what they send.

pub mod consumer;
pub mod delivery;
pub mod error;
pub mod input;
pub mod output;
pub mod transport;

pub use consumer::{ConsumerInfo, ConsumerSnapshot};
pub use error::ChannelError;
pub use input::{InputChannel, InputEvent};
pub use output::OutputChannel;
