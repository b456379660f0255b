// Error taxonomy crossing the public API surface.
//
// Internals use anyhow; these typed variants are what operation calls
// (download, set, delete, next, ...) reject with.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    /// Manifest or artifact fetch failure
    #[error("network error: {0}")]
    Network(String),

    /// Downloaded artifact does not match the manifest checksum
    #[error("checksum mismatch for bundle {id}: expected {expected}, got {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    /// Operation on an unknown bundle id or version name
    #[error("bundle not found: {0}")]
    NotFound(String),

    /// Operation illegal for the bundle's current status
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Durable store read/write failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl UpdateError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        UpdateError::Network(err.to_string())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        UpdateError::Storage(err.to_string())
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;
