use super::decision::{Alert, AuditSnapshot, Decision};
use super::scoring::{ScoreRequest, ScoreResponse, ScoringFailure, Transport};
use super::transaction::{CardFingerprint, Transaction, TxnId};
use super::velocity::{Scope, Window};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Behavioural counters per card and merchant.
///
/// Writes come from the transaction path and are treated as best effort by the
/// caller. Reads never block on writes for other keys.
#[async_trait]
pub trait VelocityStore: Send + Sync {
    /// Increments every counter touched by one transaction. Non-positive
    /// amounts are ignored.
    async fn record(
        &self,
        card: &CardFingerprint,
        merchant_id: &str,
        amount_minor: i64,
        terminal_id: Option<&str>,
    ) -> Result<()>;
    async fn count(&self, scope: &Scope, window: Window) -> Result<u64>;
    async fn amount_sum(&self, scope: &Scope, window: Window) -> Result<i64>;
    async fn distinct_terminals(&self, card: &CardFingerprint, window: Window) -> Result<u64>;
    async fn last_seen(&self, card: &CardFingerprint) -> Result<Option<DateTime<Utc>>>;
    /// Sums hourly buckets. `hours` is capped to the bucket retention.
    async fn count_over_hours(&self, scope: &Scope, hours: u32) -> Result<u64>;
    async fn amount_over_hours(&self, scope: &Scope, hours: u32) -> Result<i64>;
    /// Transactions in the current calendar day and the `days - 1` before it,
    /// from daily buckets. `days` is capped to the bucket retention.
    async fn count_over_days(&self, scope: &Scope, days: u32) -> Result<u64>;
    async fn clear(&self, card: &CardFingerprint, merchant_id: &str) -> Result<()>;
    /// Evicts expired keys. Backends with native expiry return 0.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Durable record of transactions, decisions and alerts.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save_transaction(&self, tx: &Transaction) -> Result<()>;
    async fn find_transaction(&self, txn_id: TxnId) -> Result<Option<Transaction>>;
    async fn update_acquirer_response(&self, txn_id: TxnId, code: &str) -> Result<()>;
    async fn save_decision(&self, decision: &Decision) -> Result<()>;
    async fn find_decision(&self, txn_id: TxnId) -> Result<Option<Decision>>;
    async fn save_alert(&self, alert: &Alert) -> Result<()>;
    async fn find_alerts(&self, txn_id: TxnId) -> Result<Vec<Alert>>;
    /// Highest transaction id ever stored, so id assignment survives restarts.
    async fn max_txn_id(&self) -> Result<Option<TxnId>>;
}

/// Best-effort sink for decision snapshots.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, snapshot: &AuditSnapshot) -> Result<()>;
}

/// The remote ML scorer, reachable over either transport.
#[async_trait]
pub trait RemoteScorer: Send + Sync {
    async fn score(
        &self,
        transport: Transport,
        request: &ScoreRequest<'_>,
    ) -> std::result::Result<ScoreResponse, ScoringFailure>;

    /// Cheap connectivity check used before re-promoting a transport.
    async fn ping(&self, transport: Transport) -> std::result::Result<(), ScoringFailure>;
}

/// One network stability sample.
#[async_trait]
pub trait StabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Hot-reloadable key/value configuration.
pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type VelocityStoreArc = Arc<dyn VelocityStore>;
pub type PersistenceGatewayArc = Arc<dyn PersistenceGateway>;
pub type AuditSinkArc = Arc<dyn AuditSink>;
pub type RemoteScorerArc = Arc<dyn RemoteScorer>;
pub type StabilityProbeArc = Arc<dyn StabilityProbe>;
pub type ConfigProviderArc = Arc<dyn ConfigProvider>;
pub type ClockArc = Arc<dyn Clock>;
