use thiserror::Error;

/// Result alias used across the flag repository and client.
pub type Result<T> = std::result::Result<T, FlagError>;

/// Failures surfaced by repository, API and client operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlagError {
    /// No session, or the session is not recognized.
    #[error("Unauthorized")]
    Unauthorized,

    /// Empty or whitespace-only key, or a key outside the allowed pattern.
    #[error("{0}")]
    InvalidArgument(String),

    /// The key is not present in the loaded document.
    #[error("Flag not found: {0}")]
    NotFound(String),

    /// Reading or writing the document store failed.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Duplicate key on create, or the document changed since it was read.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The flags service could not be reached or answered unexpectedly.
    #[error("Request failed: {0}")]
    Transport(String),
}

/// Failures reported by a [`crate::store::DocumentStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    Unavailable(String),

    /// The write condition did not hold against the stored document.
    #[error("document was modified concurrently")]
    Conflict,
}

impl From<StoreError> for FlagError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => FlagError::StorageUnavailable(msg),
            StoreError::Conflict => FlagError::Conflict(
                "flags were modified by another request, reload and try again".to_string(),
            ),
        }
    }
}
