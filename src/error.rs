//! Error kinds shared across the gateway and the streamer.

/// Crate-wide error type.
///
/// Transient peer errors (timeouts, closed sessions) stay local to the
/// gateway: they are logged and the peer is dropped, nothing surfaces to
/// callers. The kinds below are the ones that cross an API boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Returned by every public API once shutdown has begun.
    #[error("shutting down")]
    Shutdown,
    #[error("timed out")]
    Timeout,
    #[error("peer connection closed")]
    PeerClosed,
    #[error("host is blacklisted")]
    BlacklistRejected,
    #[error("peer limit reached")]
    TooManyPeers,
    #[error("refusing connection to self")]
    SelfConnect,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("data source failure: {0}")]
    DataSource(String),
    #[error("persist failure: {0}")]
    Persist(String),
}

pub type Result<T> = std::result::Result<T, Error>;
