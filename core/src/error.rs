/// Error types for the sync cache
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Device storage could not be opened (or was used before `ensure_schema`)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage read error: {0}")]
    StorageRead(String),

    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// Remote subscription or write failure
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Duplicate message identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Invalid message state: {0}")]
    InvalidState(String),

    /// The reconciler task for this thread has shut down
    #[error("Reconciler closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
