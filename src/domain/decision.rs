use super::features::FeatureSet;
use super::transaction::TxnId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Alert,
    Hold,
    Block,
}

impl Action {
    /// Severity used for escalation. HOLD and ALERT share the review tier, but
    /// HOLD outranks ALERT so an AML escalation never turns a HOLD into an ALERT.
    fn severity(self) -> u8 {
        match self {
            Action::Allow => 0,
            Action::Alert => 1,
            Action::Hold => 2,
            Action::Block => 3,
        }
    }

    /// Returns the more severe of `self` and `floor`.
    pub fn at_least(self, floor: Action) -> Action {
        if floor.severity() > self.severity() {
            floor
        } else {
            self
        }
    }

    /// Acquirer response code written back to the transaction, if any.
    pub fn acquirer_code(self) -> Option<&'static str> {
        match self {
            Action::Block => Some("05"),
            Action::Hold => Some("01"),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Alert => "ALERT",
            Action::Hold => "HOLD",
            Action::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The recorded decision for a transaction. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub txn_id: TxnId,
    pub action: Action,
    pub score: f64,
    pub reasons: Vec<String>,
    pub acquirer_response: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
}

/// Review item raised for BLOCK and HOLD decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub txn_id: TxnId,
    pub score: f64,
    pub action: Action,
    pub reason: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

/// Audit/training record written for every decision regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub txn_id: TxnId,
    pub score: f64,
    pub action: Action,
    pub reasons: Vec<String>,
    pub features: FeatureSet,
    pub recorded_at: DateTime<Utc>,
}
