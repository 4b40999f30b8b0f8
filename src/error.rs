use thiserror::Error;

/// Why the admission layer turned a transaction away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Global request rate ceiling exceeded (HTTP 429).
    RateLimited,
    /// In-flight slots and overflow buffer both exhausted (HTTP 503).
    OverCapacity,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::RateLimited => write!(f, "rate limit exceeded"),
            RejectReason::OverCapacity => write!(f, "too many concurrent requests"),
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Admission rejected: {0}")]
    AdmissionRejected(RejectReason),
    #[error("Feature computation degraded: {0}")]
    FeatureComputationDegraded(String),
    #[error("Scoring unavailable: {0}")]
    ScoringUnavailable(String),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDBError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
