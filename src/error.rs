use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Handshake timed out on pipe {0}")]
    HandshakeTimeout(&'static str),

    #[error("Handshake failed on pipe {0}: bad ping/pong value")]
    HandshakeFailed(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer closed the channel")]
    PeerClosed,

    #[error("Worker {0} died unexpectedly")]
    WorkerDied(usize),

    #[error("Fleet terminated by signal")]
    Terminated,

    #[error("Poll interrupted by signal")]
    Interrupted,

    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, FleetError>;
