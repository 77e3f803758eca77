//! Error types for the ingestion pipeline and its collaborators.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type aggregating component errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not valid UTF-8")]
    NotUnicode(String),
}

/// Archive extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The central directory cannot be read. Covers 0-byte and truncated archives.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// An entry would write outside the extract root.
    #[error("archive entry escapes extract root: {0}")]
    PathEscape(String),

    #[error("i/o error extracting {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Document and vector store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document store error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("vector store request failed: {0}")]
    VectorRequest(#[from] reqwest::Error),

    #[error("vector store rejected request: {status}: {body}")]
    VectorRejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed vector store response: {0}")]
    VectorResponse(String),
}

impl StoreError {
    /// Socket-level and 5xx failures are retryable; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Mongo(error) => {
                use mongodb::error::ErrorKind;
                matches!(
                    *error.kind,
                    ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. }
                )
            }
            StoreError::VectorRequest(error) => error.is_timeout() || error.is_connect(),
            StoreError::VectorRejected { status, .. } => status.is_server_error(),
            StoreError::VectorResponse(_) => false,
        }
    }
}

/// Embedding endpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Timeout or 5xx from the endpoint. Retried with backoff.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// 4xx, malformed response, or retry budget exhausted.
    #[error("embedding failed: {0}")]
    Permanent(String),

    /// The endpoint returned a vector of an unexpected dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Pipeline controller errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("extract directory missing on resume: {0}")]
    MissingExtractDir(PathBuf),

    #[error("archive missing for job {0}")]
    MissingArchive(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let rejected = StoreError::VectorRejected {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".into(),
        };
        assert!(rejected.is_transient());

        let rejected = StoreError::VectorRejected {
            status: reqwest::StatusCode::BAD_REQUEST,
            body: "no".into(),
        };
        assert!(!rejected.is_transient());

        assert!(!StoreError::VectorResponse("bad json".into()).is_transient());
    }

    #[test]
    fn error_messages_name_the_offender() {
        let error = ExtractError::PathEscape("../../etc/passwd".into());
        assert!(error.to_string().contains("../../etc/passwd"));

        let error = PipelineError::InvalidTransition {
            from: "COMPLETE".into(),
            to: "EXTRACTING".into(),
        };
        assert!(error.to_string().contains("COMPLETE"));
        assert!(error.to_string().contains("EXTRACTING"));
    }
}
