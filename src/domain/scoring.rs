use super::features::FeatureSet;
use super::transaction::TxnId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Wire transport used to reach the remote scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Multiplexed HTTP/2 (prior knowledge). Preferred when healthy.
    Http2,
    /// HTTP/1.1 with a connection pool. The safe fallback.
    Http1,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Http2 => write!(f, "HTTP/2"),
            Transport::Http1 => write!(f, "HTTP/1.1"),
        }
    }
}

/// Body of `POST {scoring_url}/score`.
#[derive(Debug, Serialize)]
pub struct ScoreRequest<'a> {
    pub txn_id: TxnId,
    pub features: &'a FeatureSet,
}

/// Scorer reply. Anything beyond `score` and `latency_ms` is kept as risk detail.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreResponse {
    pub score: f64,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(flatten)]
    pub risk_details: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub txn_id: TxnId,
    /// Fraud probability in `[0, 1]`.
    pub score: f64,
    pub latency_ms: u64,
    #[serde(default)]
    pub risk_details: BTreeMap<String, serde_json::Value>,
    /// Served from the replay cache instead of the remote scorer.
    #[serde(default)]
    pub cached: bool,
}

/// Failure of a single remote scoring attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("scorer returned status {0}")]
    Status(u16),
    #[error("invalid scorer response: {0}")]
    Decode(String),
}

impl ScoringFailure {
    /// Whether the failure looks like a dropped connection rather than an
    /// application-level error.
    pub fn is_drop(&self) -> bool {
        matches!(self, ScoringFailure::Timeout | ScoringFailure::Connection(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScoringFailure::Timeout => "timeout",
            ScoringFailure::Connection(_) => "connection",
            ScoringFailure::Status(_) => "status",
            ScoringFailure::Decode(_) => "decode",
        }
    }
}
