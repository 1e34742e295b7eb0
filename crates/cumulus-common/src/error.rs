//! Error types for the aggregation pipeline

use thiserror::Error;

/// Result type alias for Cumulus operations
pub type Result<T> = std::result::Result<T, CumulusError>;

/// Error kinds shared by the pipeline workers and the read API.
///
/// Some kinds are benign: [`CumulusError::StaleArtifact`] and
/// [`CumulusError::AlreadyDispatched`] describe fan-in states that a worker
/// reports as a normal response instead of a failure.
#[derive(Error, Debug)]
pub enum CumulusError {
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Unexpected file type: {0}")]
    UnexpectedFileType(String),

    #[error("Upload contains no rows: {0}")]
    EmptyUpload(String),

    #[error("Upload columns do not match the aggregate: {0}")]
    SchemaDrift(String),

    #[error("No data available to aggregate for {0}")]
    NoData(String),

    #[error("Artifact predates upload: {0}")]
    StaleArtifact(String),

    #[error("Upload transaction already dispatched: {0}")]
    AlreadyDispatched(String),

    #[error("Crawler still running: {0}")]
    CrawlerBusy(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Presigned URL rejected: {0}")]
    PresignFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CumulusError {
    /// Whether this error describes a benign pipeline state rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CumulusError::StaleArtifact(_) | CumulusError::AlreadyDispatched(_)
        )
    }

    /// Whether the offending file should be moved to `error/` and processing continue.
    pub fn is_recoverable_upload_error(&self) -> bool {
        matches!(
            self,
            CumulusError::EmptyUpload(_) | CumulusError::SchemaDrift(_)
        )
    }
}
