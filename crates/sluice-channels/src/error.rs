use sluice_core::wire::WireError;
use sluice_pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not bind listener after {attempts} attempts: {source}")]
    Network {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("can not write data because no shared input is available")]
    NoSharedInput,

    #[error("can not write copied data because input channel of {0} was too late")]
    CopyInputNotReady(String),

    #[error("unexpected {0:?} frame from peer")]
    Protocol(sluice_core::wire::FrameKind),
}
