#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    Sys(#[from] nix::Error),

    #[error("Operation timed out")]
    Timeout,

    #[error("Failed to receive ACK packets for all the sent packets")]
    AckDrain,

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Socket has been closed")]
    Closed,

    #[error("Malformed packet: {0}")]
    BadPacket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("User is not authenticated")]
    NotAuthenticated,

    #[error("{0}")]
    Filesystem(String),

    #[error("No free port left in the data-port pool")]
    PoolExhausted,
}
