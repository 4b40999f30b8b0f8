use crate::domain::decision::{Alert, AuditSnapshot, Decision};
use crate::domain::ports::{
    AuditSink, ClockArc, ConfigProvider, PersistenceGateway, VelocityStore,
};
use crate::domain::transaction::{CardFingerprint, Transaction, TxnId};
use crate::domain::velocity::{
    Dimension, Granularity, MAX_BUCKET_DAYS, MAX_BUCKET_HOURS, Scope, VelocityCounter, Window,
    counter_key,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// A counter whose lifetime is fixed when it is created.
#[derive(Debug)]
struct ExpiringCounter {
    value: AtomicI64,
    expires_at: DateTime<Utc>,
}

impl ExpiringCounter {
    fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            value: AtomicI64::new(0),
            expires_at,
        }
    }

    fn live_value(&self, now: DateTime<Utc>) -> i64 {
        if self.expires_at > now {
            self.value.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

/// Map key for a counter. The scope is kept apart from the counter name so
/// that lookups by scope never depend on how ids are spelled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterId {
    scope: Scope,
    name: String,
}

impl CounterId {
    fn rolling(scope: &Scope, dimension: Dimension, window: Window) -> Self {
        Self {
            scope: scope.clone(),
            name: counter_key(scope, dimension, window),
        }
    }

    fn bucket(scope: &Scope, dimension: Dimension, granularity: Granularity, start: i64) -> Self {
        let g = match granularity {
            Granularity::Hour => "h",
            Granularity::Day => "d",
        };
        Self {
            scope: scope.clone(),
            name: format!("vel:{}:{}:{}:{}", scope, dimension.label(), g, start),
        }
    }
}

type CounterMap = DashMap<CounterId, ExpiringCounter>;

/// Adds `by` to the counter at `key`, creating it with `ttl` if it is missing
/// or expired. Increments on a live counter never extend its lifetime.
fn increment(map: &CounterMap, key: CounterId, by: i64, ttl: chrono::Duration, now: DateTime<Utc>) {
    if let Some(counter) = map.get(&key)
        && counter.expires_at > now
    {
        counter.value.fetch_add(by, Ordering::Relaxed);
        return;
    }
    let mut counter = map
        .entry(key)
        .or_insert_with(|| ExpiringCounter::new(now + ttl));
    if counter.expires_at <= now {
        *counter = ExpiringCounter::new(now + ttl);
    }
    counter.value.fetch_add(by, Ordering::Relaxed);
}

fn read(map: &CounterMap, key: &CounterId, now: DateTime<Utc>) -> i64 {
    map.get(key).map_or(0, |c| c.live_value(now))
}

/// In-process velocity store.
///
/// Rolling windows are pre-aggregated counters updated with atomic adds, so the
/// common reads are a single map lookup. Hourly buckets back non-standard
/// windows and daily count buckets back the per-day card history. Distinct terminals are kept as a per-card map of
/// terminal to last time seen.
#[derive(Clone)]
pub struct InMemoryVelocityStore {
    clock: ClockArc,
    rolling: Arc<CounterMap>,
    buckets: Arc<CounterMap>,
    terminals: Arc<DashMap<String, HashMap<String, DateTime<Utc>>>>,
    last_seen: Arc<DashMap<String, DateTime<Utc>>>,
}

impl InMemoryVelocityStore {
    pub fn new(clock: ClockArc) -> Self {
        Self {
            clock,
            rolling: Arc::new(DashMap::new()),
            buckets: Arc::new(DashMap::new()),
            terminals: Arc::new(DashMap::new()),
            last_seen: Arc::new(DashMap::new()),
        }
    }

    /// Live rolling-window counters for `scope`.
    pub fn counters(&self, scope: &Scope) -> Vec<VelocityCounter> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for dimension in [Dimension::Count, Dimension::AmountSum] {
            for window in Window::ALL {
                let key = CounterId::rolling(scope, dimension, window);
                if let Some(counter) = self.rolling.get(&key)
                    && counter.expires_at > now
                {
                    out.push(VelocityCounter {
                        scope: scope.clone(),
                        dimension,
                        window,
                        value: counter.value.load(Ordering::Relaxed),
                        expires_at: counter.expires_at,
                    });
                }
            }
        }
        out
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.rolling.len() + self.buckets.len() + self.terminals.len() + self.last_seen.len()
    }

    fn bump(&self, scope: &Scope, amount_minor: i64, now: DateTime<Utc>) {
        for window in Window::ALL {
            increment(&self.rolling, CounterId::rolling(scope, Dimension::Count, window), 1, window.ttl(), now);
            increment(
                &self.rolling,
                CounterId::rolling(scope, Dimension::AmountSum, window),
                amount_minor,
                window.ttl(),
                now,
            );
        }

        let hour = Granularity::Hour.bucket_start(now);
        increment(
            &self.buckets,
            CounterId::bucket(scope, Dimension::Count, Granularity::Hour, hour),
            1,
            Granularity::Hour.ttl(),
            now,
        );
        increment(
            &self.buckets,
            CounterId::bucket(scope, Dimension::AmountSum, Granularity::Hour, hour),
            amount_minor,
            Granularity::Hour.ttl(),
            now,
        );
        let day = Granularity::Day.bucket_start(now);
        increment(
            &self.buckets,
            CounterId::bucket(scope, Dimension::Count, Granularity::Day, day),
            1,
            Granularity::Day.ttl(),
            now,
        );
    }

    /// Sums the most recent `spans` buckets of `granularity`, current one included.
    fn sum_buckets(&self, scope: &Scope, dimension: Dimension, granularity: Granularity, spans: u32) -> i64 {
        let now = self.clock.now();
        let current = granularity.bucket_start(now);
        let width = granularity.width_secs();
        (0..i64::from(spans))
            .map(|i| {
                let key = CounterId::bucket(scope, dimension, granularity, current - i * width);
                read(&self.buckets, &key, now)
            })
            .sum()
    }
}

#[async_trait]
impl VelocityStore for InMemoryVelocityStore {
    async fn record(
        &self,
        card: &CardFingerprint,
        merchant_id: &str,
        amount_minor: i64,
        terminal_id: Option<&str>,
    ) -> Result<()> {
        if amount_minor <= 0 {
            return Ok(());
        }
        let now = self.clock.now();
        self.bump(&Scope::card(card), amount_minor, now);
        self.bump(&Scope::merchant(merchant_id), amount_minor, now);

        if let Some(terminal) = terminal_id.filter(|t| !t.is_empty()) {
            self.terminals
                .entry(card.as_str().to_string())
                .or_default()
                .insert(terminal.to_string(), now);
        }
        self.last_seen.insert(card.as_str().to_string(), now);
        Ok(())
    }

    async fn count(&self, scope: &Scope, window: Window) -> Result<u64> {
        let now = self.clock.now();
        let value = read(&self.rolling, &CounterId::rolling(scope, Dimension::Count, window), now);
        Ok(value.max(0) as u64)
    }

    async fn amount_sum(&self, scope: &Scope, window: Window) -> Result<i64> {
        let now = self.clock.now();
        Ok(read(&self.rolling, &CounterId::rolling(scope, Dimension::AmountSum, window), now).max(0))
    }

    async fn distinct_terminals(&self, card: &CardFingerprint, window: Window) -> Result<u64> {
        let since = self.clock.now() - window.duration();
        Ok(self.terminals.get(card.as_str()).map_or(0, |seen| {
            seen.values().filter(|at| **at > since).count() as u64
        }))
    }

    async fn last_seen(&self, card: &CardFingerprint) -> Result<Option<DateTime<Utc>>> {
        let cutoff = self.clock.now() - Window::Month.ttl();
        Ok(self
            .last_seen
            .get(card.as_str())
            .map(|at| *at)
            .filter(|at| *at > cutoff))
    }

    async fn count_over_hours(&self, scope: &Scope, hours: u32) -> Result<u64> {
        let hours = hours.min(MAX_BUCKET_HOURS);
        Ok(self.sum_buckets(scope, Dimension::Count, Granularity::Hour, hours).max(0) as u64)
    }

    async fn amount_over_hours(&self, scope: &Scope, hours: u32) -> Result<i64> {
        let hours = hours.min(MAX_BUCKET_HOURS);
        Ok(self.sum_buckets(scope, Dimension::AmountSum, Granularity::Hour, hours).max(0))
    }

    async fn count_over_days(&self, scope: &Scope, days: u32) -> Result<u64> {
        let days = days.min(MAX_BUCKET_DAYS);
        Ok(self.sum_buckets(scope, Dimension::Count, Granularity::Day, days).max(0) as u64)
    }

    async fn clear(&self, card: &CardFingerprint, merchant_id: &str) -> Result<()> {
        let card_scope = Scope::card(card);
        let merchant_scope = Scope::merchant(merchant_id);
        let keep = |key: &CounterId, _: &mut ExpiringCounter| {
            key.scope != card_scope && key.scope != merchant_scope
        };
        self.rolling.retain(keep);
        self.buckets.retain(keep);
        self.terminals.remove(card.as_str());
        self.last_seen.remove(card.as_str());
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let before = self.key_count();

        self.rolling.retain(|_, c| c.expires_at > now);
        self.buckets.retain(|_, c| c.expires_at > now);

        let cutoff = now - Window::Month.ttl();
        self.terminals.retain(|_, seen| {
            seen.retain(|_, at| *at > cutoff);
            !seen.is_empty()
        });
        self.last_seen.retain(|_, at| *at > cutoff);

        Ok(before.saturating_sub(self.key_count()))
    }
}

/// A thread-safe in-memory persistence gateway.
///
/// Ideal for tests and for replaying files where nothing needs to outlive the
/// process.
#[derive(Default, Clone)]
pub struct InMemoryPersistence {
    transactions: Arc<RwLock<HashMap<TxnId, Transaction>>>,
    decisions: Arc<RwLock<HashMap<TxnId, Decision>>>,
    alerts: Arc<RwLock<HashMap<TxnId, Vec<Alert>>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn decision_count(&self) -> usize {
        self.decisions.read().await.len()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryPersistence {
    async fn save_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(tx.txn_id, tx.clone());
        Ok(())
    }

    async fn find_transaction(&self, txn_id: TxnId) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&txn_id).cloned())
    }

    async fn update_acquirer_response(&self, txn_id: TxnId, code: &str) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if let Some(tx) = transactions.get_mut(&txn_id) {
            tx.acquirer_response = Some(code.to_string());
        }
        Ok(())
    }

    async fn save_decision(&self, decision: &Decision) -> Result<()> {
        let mut decisions = self.decisions.write().await;
        // First write wins; decisions are immutable.
        decisions
            .entry(decision.txn_id)
            .or_insert_with(|| decision.clone());
        Ok(())
    }

    async fn find_decision(&self, txn_id: TxnId) -> Result<Option<Decision>> {
        let decisions = self.decisions.read().await;
        Ok(decisions.get(&txn_id).cloned())
    }

    async fn save_alert(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        alerts.entry(alert.txn_id).or_default().push(alert.clone());
        Ok(())
    }

    async fn find_alerts(&self, txn_id: TxnId) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts.get(&txn_id).cloned().unwrap_or_default())
    }

    async fn max_txn_id(&self) -> Result<Option<TxnId>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.keys().max().copied())
    }
}

/// Keeps audit snapshots in memory, in write order.
#[derive(Default, Clone)]
pub struct InMemoryAuditSink {
    snapshots: Arc<RwLock<Vec<AuditSnapshot>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshots(&self) -> Vec<AuditSnapshot> {
        self.snapshots.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn write(&self, snapshot: &AuditSnapshot) -> Result<()> {
        self.snapshots.write().await.push(snapshot.clone());
        Ok(())
    }
}

/// Key/value settings held in process. Updates are visible immediately.
#[derive(Default)]
pub struct InMemoryConfigProvider {
    values: DashMap<String, String>,
}

impl InMemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigProvider for InMemoryConfigProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }
}
