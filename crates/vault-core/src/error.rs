use thiserror::Error;
use vault_paths::PathError;

use crate::fs::DiskError;
use crate::history::HistoryError;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document {0} is not valid UTF-8")]
    NotText(String),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl VaultError {
    pub fn invalid_path(path: &str, reason: impl ToString) -> Self {
        VaultError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn from_path_error(path: &str, e: PathError) -> Self {
        Self::invalid_path(path, e)
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(e: tokio::task::JoinError) -> Self {
        VaultError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
