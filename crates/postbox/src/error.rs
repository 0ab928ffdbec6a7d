//! Error types.

use thiserror::Error;

/// Failure reading or writing the envelope wire format.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The input is not a well-formed envelope
    #[error("Corrupt envelope: {0}")]
    Corrupt(String),

    /// Reading from or writing to the underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header could not be encoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnvelopeError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        EnvelopeError::Corrupt(reason.into())
    }

    /// Whether the data itself is bad (as opposed to the stream failing).
    pub fn is_corrupt(&self) -> bool {
        matches!(self, EnvelopeError::Corrupt(_))
    }
}

/// Failure constructing the delivery pipeline.
///
/// Only construction can fail. Once a client exists every public entry
/// point is best effort and reports problems through logs instead.
#[derive(Error, Debug)]
pub enum PostboxError {
    /// The cache directory could not be created or is unusable
    #[error("Cache directory unavailable: {path}: {source}")]
    CacheDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The background executor could not be started
    #[error("Failed to start background executor: {0}")]
    Executor(#[source] std::io::Error),
}

/// Result type alias using PostboxError.
pub type PostboxResult<T> = Result<T, PostboxError>;
