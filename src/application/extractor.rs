use crate::application::emv;
use crate::config::PipelineConfig;
use crate::domain::features::{FeatureSet, UNKNOWN};
use crate::domain::ports::{ClockArc, VelocityStoreArc};
use crate::domain::transaction::{Transaction, currency_exponent};
use crate::domain::velocity::{Scope, Window};
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::future::Future;
use std::time::Duration;

/// Days of daily buckets behind `num_high_value_txn_7d`.
const HISTORY_DAYS: u32 = 7;

/// Velocity reads needed for one transaction. `None` means the lookup failed.
#[derive(Debug, Default)]
struct Lookups {
    merchant_count_1h: Option<u64>,
    merchant_amount_24h: Option<i64>,
    card_count_1h: Option<u64>,
    card_amount_7d: Option<i64>,
    card_count_7d_daily: Option<u64>,
    card_count_30d: Option<u64>,
    card_amount_30d: Option<i64>,
    distinct_terminals_30d: Option<u64>,
    last_seen: Option<Option<DateTime<Utc>>>,
}

impl Lookups {
    fn any_failed(&self) -> bool {
        self.merchant_count_1h.is_none()
            || self.merchant_amount_24h.is_none()
            || self.card_count_1h.is_none()
            || self.card_amount_7d.is_none()
            || self.card_count_7d_daily.is_none()
            || self.card_count_30d.is_none()
            || self.card_amount_30d.is_none()
            || self.distinct_terminals_30d.is_none()
            || self.last_seen.is_none()
    }
}

/// Output of a feature extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub features: FeatureSet,
    /// At least one velocity lookup failed or timed out.
    pub degraded: bool,
}

/// Builds the flat feature map for a transaction.
///
/// Static and EMV features are computed locally. Velocity lookups run
/// concurrently under one bounded wait; if that fails for any reason they are
/// re-run one by one, each with its own timeout, and whatever still fails is
/// replaced by the unknown sentinel. Extraction itself never fails.
pub struct FeatureExtractor {
    velocity: VelocityStoreArc,
    clock: ClockArc,
    join_timeout: Duration,
    lookup_timeout: Duration,
}

impl FeatureExtractor {
    pub fn new(velocity: VelocityStoreArc, clock: ClockArc, config: &PipelineConfig) -> Self {
        Self {
            velocity,
            clock,
            join_timeout: Duration::from_millis(config.feature_timeout_ms),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
        }
    }

    pub async fn extract(&self, tx: &Transaction) -> Extraction {
        let mut features = FeatureSet::new();
        static_features(tx, &mut features);
        emv::decode(&tx.emv_tags, &mut features);

        let lookups = match tokio::time::timeout(self.join_timeout, self.parallel_lookups(tx)).await {
            Ok(Ok(lookups)) => lookups,
            Ok(Err(e)) => {
                tracing::debug!(txn_id = %tx.txn_id, error = %e, "parallel velocity lookup failed, retrying sequentially");
                self.sequential_lookups(tx).await
            }
            Err(_) => {
                tracing::debug!(txn_id = %tx.txn_id, "parallel velocity lookup timed out, retrying sequentially");
                self.sequential_lookups(tx).await
            }
        };

        let degraded = lookups.any_failed();
        if degraded {
            let err = GatewayError::FeatureComputationDegraded(format!("txn {}", tx.txn_id));
            tracing::warn!(txn_id = %tx.txn_id, error = %err, "continuing with partial features");
            crate::metrics::record_features_degraded();
        }
        self.velocity_features(tx, &lookups, &mut features);
        features.insert("features_degraded", degraded);

        Extraction { features, degraded }
    }

    async fn parallel_lookups(&self, tx: &Transaction) -> Result<Lookups> {
        let card = Scope::card(&tx.card_fingerprint);
        let merchant = Scope::merchant(tx.merchant_id.as_str());
        let store = &self.velocity;

        let (mc1h, ma24h, cc1h, ca7d, cc7d, cc30d, ca30d, terminals, last_seen) = tokio::try_join!(
            store.count(&merchant, Window::OneHour),
            store.amount_sum(&merchant, Window::Day),
            store.count(&card, Window::OneHour),
            store.amount_sum(&card, Window::Week),
            store.count_over_days(&card, HISTORY_DAYS),
            store.count(&card, Window::Month),
            store.amount_sum(&card, Window::Month),
            store.distinct_terminals(&tx.card_fingerprint, Window::Month),
            store.last_seen(&tx.card_fingerprint),
        )?;

        Ok(Lookups {
            merchant_count_1h: Some(mc1h),
            merchant_amount_24h: Some(ma24h),
            card_count_1h: Some(cc1h),
            card_amount_7d: Some(ca7d),
            card_count_7d_daily: Some(cc7d),
            card_count_30d: Some(cc30d),
            card_amount_30d: Some(ca30d),
            distinct_terminals_30d: Some(terminals),
            last_seen: Some(last_seen),
        })
    }

    async fn sequential_lookups(&self, tx: &Transaction) -> Lookups {
        let card = Scope::card(&tx.card_fingerprint);
        let merchant = Scope::merchant(tx.merchant_id.as_str());
        let store = &self.velocity;

        Lookups {
            merchant_count_1h: self.bounded("merchant_txn_count_1h", store.count(&merchant, Window::OneHour)).await,
            merchant_amount_24h: self.bounded("merchant_txn_amount_sum_24h", store.amount_sum(&merchant, Window::Day)).await,
            card_count_1h: self.bounded("pan_txn_count_1h", store.count(&card, Window::OneHour)).await,
            card_amount_7d: self.bounded("pan_txn_amount_sum_7d", store.amount_sum(&card, Window::Week)).await,
            card_count_7d_daily: self.bounded("num_high_value_txn_7d", store.count_over_days(&card, HISTORY_DAYS)).await,
            card_count_30d: self.bounded("pan_txn_count_30d", store.count(&card, Window::Month)).await,
            card_amount_30d: self.bounded("pan_txn_amount_sum_30d", store.amount_sum(&card, Window::Month)).await,
            distinct_terminals_30d: self
                .bounded("distinct_terminals_last_30d_for_pan", store.distinct_terminals(&tx.card_fingerprint, Window::Month))
                .await,
            last_seen: self.bounded("last_seen", store.last_seen(&tx.card_fingerprint)).await,
        }
    }

    async fn bounded<T>(&self, name: &'static str, lookup: impl Future<Output = Result<T>>) -> Option<T> {
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::debug!(lookup = name, error = %e, "velocity lookup failed");
                None
            }
            Err(_) => {
                tracing::debug!(lookup = name, "velocity lookup timed out");
                None
            }
        }
    }

    fn velocity_features(&self, tx: &Transaction, lookups: &Lookups, features: &mut FeatureSet) {
        let int = |v: Option<i64>| v.unwrap_or(UNKNOWN);
        let count = |v: Option<u64>| v.map_or(UNKNOWN, |c| i64::try_from(c).unwrap_or(i64::MAX));

        features.insert("merchant_txn_count_1h", count(lookups.merchant_count_1h));
        features.insert("merchant_txn_amount_sum_24h", int(lookups.merchant_amount_24h));
        features.insert("pan_txn_count_1h", count(lookups.card_count_1h));
        features.insert("pan_txn_amount_sum_7d", int(lookups.card_amount_7d));
        features.insert("distinct_terminals_last_30d_for_pan", count(lookups.distinct_terminals_30d));

        let average = match (lookups.card_amount_30d, lookups.card_count_30d) {
            (Some(sum), Some(n)) if n > 0 => sum as f64 / n as f64,
            _ => UNKNOWN as f64,
        };
        features.insert("avg_amount_by_pan_30d", average);
        features.insert("zscore_amount_vs_pan_history", amount_zscore(tx, average));
        features.insert("num_high_value_txn_7d", count(lookups.card_count_7d_daily));

        let minutes_since_last = match lookups.last_seen {
            Some(Some(at)) => (self.clock.now() - at).num_minutes().max(0),
            _ => UNKNOWN,
        };
        features.insert("time_since_last_txn_for_pan_minutes", minutes_since_last);

        let cumulative = lookups
            .card_amount_30d
            .map_or(UNKNOWN, |prior| prior.saturating_add(tx.amount.minor_units()));
        features.insert("cumulative_debits_30d", cumulative);
    }
}

/// Distance of the amount from the card's 30-day average, relative to that
/// average (floored at one major unit). Unknown without history.
fn amount_zscore(tx: &Transaction, average_minor: f64) -> f64 {
    if average_minor <= 0.0 {
        return UNKNOWN as f64;
    }
    let scale = 10f64.powi(currency_exponent(&tx.currency) as i32);
    let current = tx.amount.minor_units() as f64 / scale;
    let average = average_minor / scale;
    (current - average) / average.max(1.0)
}

fn static_features(tx: &Transaction, features: &mut FeatureSet) {
    let amount = tx.amount_major().to_f64().unwrap_or(UNKNOWN as f64);
    features.insert("amount", amount);
    features.insert("amount_minor", tx.amount.minor_units());
    features.insert("log_amount", amount.max(0.01).ln());
    features.insert("currency", tx.currency.as_str());
    features.insert("merchant_id", tx.merchant_id.as_str());
    features.insert("terminal_id", tx.terminal_id.clone().unwrap_or_default());
    features.insert(
        "card_bin_hash",
        tx.card_fingerprint.bin_hash().unwrap_or_default(),
    );
    features.insert("txn_hour_of_day", tx.timestamp.hour());
    features.insert("txn_day_of_week", tx.timestamp.weekday().number_from_monday());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Clock, VelocityStore};
    use crate::domain::transaction::{Amount, CardFingerprint, TxnId};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryVelocityStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Counts either hang forever or error; every other read goes to the
    /// wrapped store.
    struct BrokenCounts {
        inner: InMemoryVelocityStore,
        hang: bool,
    }

    impl BrokenCounts {
        async fn broken<T>(&self) -> Result<T> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(GatewayError::InternalError("counter backend unavailable".into()))
        }
    }

    #[async_trait]
    impl VelocityStore for BrokenCounts {
        async fn record(
            &self,
            card: &CardFingerprint,
            merchant_id: &str,
            amount_minor: i64,
            terminal_id: Option<&str>,
        ) -> Result<()> {
            self.inner.record(card, merchant_id, amount_minor, terminal_id).await
        }
        async fn count(&self, _: &Scope, _: Window) -> Result<u64> {
            self.broken().await
        }
        async fn amount_sum(&self, scope: &Scope, window: Window) -> Result<i64> {
            self.inner.amount_sum(scope, window).await
        }
        async fn distinct_terminals(&self, card: &CardFingerprint, window: Window) -> Result<u64> {
            self.inner.distinct_terminals(card, window).await
        }
        async fn last_seen(&self, card: &CardFingerprint) -> Result<Option<DateTime<Utc>>> {
            self.inner.last_seen(card).await
        }
        async fn count_over_hours(&self, scope: &Scope, hours: u32) -> Result<u64> {
            self.inner.count_over_hours(scope, hours).await
        }
        async fn amount_over_hours(&self, scope: &Scope, hours: u32) -> Result<i64> {
            self.inner.amount_over_hours(scope, hours).await
        }
        async fn count_over_days(&self, scope: &Scope, days: u32) -> Result<u64> {
            self.inner.count_over_days(scope, days).await
        }
        async fn clear(&self, card: &CardFingerprint, merchant_id: &str) -> Result<()> {
            self.inner.clear(card, merchant_id).await
        }
    }

    fn transaction(clock: &ManualClock, amount: i64) -> Transaction {
        Transaction {
            txn_id: TxnId(1),
            merchant_id: "m-1".to_string(),
            terminal_id: Some("t-9".to_string()),
            card_fingerprint: CardFingerprint::from_pan("4111111111111111"),
            amount: Amount::new(amount).unwrap(),
            currency: "USD".to_string(),
            timestamp: clock.now(),
            emv_tags: BTreeMap::from([("9F39".to_string(), "07".to_string())]),
            acquirer_response: None,
        }
    }

    fn setup() -> (FeatureExtractor, Arc<InMemoryVelocityStore>, ManualClock) {
        // Wednesday.
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 15, 9, 30, 0).unwrap());
        let store = Arc::new(InMemoryVelocityStore::new(Arc::new(clock.clone())));
        let extractor = FeatureExtractor::new(store.clone(), Arc::new(clock.clone()), &PipelineConfig::default());
        (extractor, store, clock)
    }

    #[tokio::test]
    async fn test_new_card_gets_sentinels() {
        let (extractor, _, clock) = setup();
        let extraction = extractor.extract(&transaction(&clock, 1_999)).await;
        let f = &extraction.features;

        assert!(!extraction.degraded);
        assert!((f.get_f64("amount").unwrap() - 19.99).abs() < 1e-9);
        assert_eq!(f.get_i64("amount_minor"), Some(1_999));
        assert_eq!(f.get_i64("txn_hour_of_day"), Some(9));
        assert_eq!(f.get_i64("txn_day_of_week"), Some(3));
        assert_eq!(f.get_i64("pan_txn_count_1h"), Some(0));
        assert_eq!(f.get_i64("time_since_last_txn_for_pan_minutes"), Some(UNKNOWN));
        assert_eq!(f.get_f64("avg_amount_by_pan_30d"), Some(UNKNOWN as f64));
        assert_eq!(f.get_i64("cumulative_debits_30d"), Some(1_999));
        assert_eq!(f.get_bool("is_contactless"), Some(true));
        assert_eq!(f.get_bool("features_degraded"), Some(false));
    }

    #[tokio::test]
    async fn test_history_feeds_velocity_features() {
        let (extractor, store, clock) = setup();
        let card = CardFingerprint::from_pan("4111111111111111");
        store.record(&card, "m-1", 1_000, Some("t-1")).await.unwrap();
        store.record(&card, "m-2", 3_000, Some("t-2")).await.unwrap();
        clock.advance(chrono::Duration::minutes(12));

        let f = extractor.extract(&transaction(&clock, 500)).await.features;

        assert_eq!(f.get_i64("pan_txn_count_1h"), Some(2));
        assert_eq!(f.get_i64("merchant_txn_count_1h"), Some(1));
        assert_eq!(f.get_i64("pan_txn_amount_sum_7d"), Some(4_000));
        assert_eq!(f.get_i64("distinct_terminals_last_30d_for_pan"), Some(2));
        assert_eq!(f.get_f64("avg_amount_by_pan_30d"), Some(2_000.0));
        assert_eq!(f.get_i64("time_since_last_txn_for_pan_minutes"), Some(12));
        assert_eq!(f.get_i64("cumulative_debits_30d"), Some(4_500));
        assert_eq!(f.get_i64("num_high_value_txn_7d"), Some(2));
        // 5.00 against an average of 20.00.
        assert_eq!(f.get_f64("zscore_amount_vs_pan_history"), Some(-0.75));
    }

    #[tokio::test]
    async fn test_zscore_floors_small_averages() {
        let (extractor, store, clock) = setup();
        let card = CardFingerprint::from_pan("4111111111111111");
        store.record(&card, "m-1", 50, None).await.unwrap();

        let f = extractor.extract(&transaction(&clock, 250)).await.features;

        // (2.50 - 0.50) / max(0.50, 1.0)
        assert_eq!(f.get_f64("zscore_amount_vs_pan_history"), Some(2.0));
    }

    #[tokio::test]
    async fn test_new_card_zscore_is_unknown() {
        let (extractor, _, clock) = setup();
        let f = extractor.extract(&transaction(&clock, 500)).await.features;

        assert_eq!(f.get_f64("zscore_amount_vs_pan_history"), Some(UNKNOWN as f64));
        assert_eq!(f.get_i64("num_high_value_txn_7d"), Some(0));
    }

    async fn extract_with_broken_counts(hang: bool) -> (Extraction, std::time::Duration) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 15, 9, 30, 0).unwrap());
        let inner = InMemoryVelocityStore::new(Arc::new(clock.clone()));
        let card = CardFingerprint::from_pan("4111111111111111");
        inner.record(&card, "m-1", 1_000, Some("t-1")).await.unwrap();
        let store = Arc::new(BrokenCounts { inner, hang });
        let extractor = FeatureExtractor::new(store, Arc::new(clock.clone()), &PipelineConfig::default());

        let started = tokio::time::Instant::now();
        let extraction = extractor.extract(&transaction(&clock, 500)).await;
        (extraction, started.elapsed())
    }

    #[tokio::test]
    async fn test_failing_counts_fall_back_to_sentinels() {
        let (extraction, _) = extract_with_broken_counts(false).await;
        let f = &extraction.features;

        assert!(extraction.degraded);
        assert_eq!(f.get_bool("features_degraded"), Some(true));
        assert_eq!(f.get_i64("pan_txn_count_1h"), Some(UNKNOWN));
        assert_eq!(f.get_i64("merchant_txn_count_1h"), Some(UNKNOWN));
        assert_eq!(f.get_f64("avg_amount_by_pan_30d"), Some(UNKNOWN as f64));
        // Lookups that still work keep their values.
        assert_eq!(f.get_i64("pan_txn_amount_sum_7d"), Some(1_000));
        assert_eq!(f.get_i64("distinct_terminals_last_30d_for_pan"), Some(1));
        assert_eq!(f.get_i64("num_high_value_txn_7d"), Some(1));
        assert_eq!(f.get_i64("amount_minor"), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_counts_are_bounded() {
        let (extraction, elapsed) = extract_with_broken_counts(true).await;
        let f = &extraction.features;

        assert!(extraction.degraded);
        assert_eq!(f.get_i64("pan_txn_count_1h"), Some(UNKNOWN));
        assert_eq!(f.get_i64("cumulative_debits_30d"), Some(1_500));
        // One joined wait plus one timeout per hanging lookup.
        let config = PipelineConfig::default();
        let bound = config.feature_timeout_ms + 3 * config.lookup_timeout_ms;
        assert!(elapsed <= std::time::Duration::from_millis(bound + 5), "{elapsed:?}");
    }
}
