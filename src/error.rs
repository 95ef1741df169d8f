//! Error taxonomy shared by the coordinator, the sync jobs and their ports.

use thiserror::Error;

/// Errors raised while synchronizing a space.
///
/// Per-document and per-batch problems (`NotFound`, `PartialFailure`) are
/// absorbed by the job and only show up in its run statistics; everything
/// else aborts the current run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Synchronization cancelled")]
    Cancelled,

    #[error("Document {id} not found on remote")]
    NotFound { id: String },

    #[error("{count} index operations failed in bulk request")]
    PartialFailure { count: usize },

    #[error("Document without id in space {space}")]
    MissingId { space: String },

    #[error("Document {id} has no update timestamp")]
    MissingUpdated { id: String },

    #[error("Remote returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Remote transport failure: {0}")]
    Transport(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watermark store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Search index failure: {0}")]
    Index(#[from] tantivy::TantivyError),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Expected operational failures: logged by message only, no diagnostics.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::Io(_) | SyncError::Transport(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
