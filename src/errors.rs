use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failure taxonomy of the sync engine. Only `Connection` has retry semantics
/// (the supervisor reconnects); everything else is scoped to one run or one
/// message and is logged, never escalated.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),
    /// The server answered NO or BAD; the session itself is still usable.
    #[error("server rejected command: {0}")]
    Protocol(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("index store error: {0}")]
    Index(String),
    #[error("classification failed: {0}")]
    Classification(String),
    #[error("notification failed: {0}")]
    Notification(String),
    #[error("flag update failed: {0}")]
    FlagUpdate(String),
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// True when the underlying session can no longer be used.
    pub fn is_connection(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }
}
