use crate::application::failover::TransportSelector;
use crate::application::health::ProtocolHealthMonitor;
use crate::config::ScoringConfig;
use crate::domain::features::FeatureSet;
use crate::domain::ports::RemoteScorerArc;
use crate::domain::scoring::{ScoreRequest, ScoringFailure, ScoringResult};
use crate::domain::transaction::TxnId;
use crate::error::{GatewayError, Result};
use moka::sync::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Calls the remote scorer with bounded retries and a short-lived result cache.
///
/// The transport is read from the shared selector on every attempt, and every
/// outcome is reported to the health monitor. The client never changes the
/// transport itself.
pub struct ScoringClient {
    scorer: RemoteScorerArc,
    selector: Arc<TransportSelector>,
    monitor: Arc<ProtocolHealthMonitor>,
    cache: Cache<TxnId, ScoringResult>,
    retry_max: u32,
    backoff: Duration,
    attempt_timeout: Duration,
}

impl ScoringClient {
    /// Creates a new `ScoringClient`.
    ///
    /// # Arguments
    ///
    /// * `config` - Retry, timeout and cache settings.
    /// * `scorer` - The remote model behind both transports.
    /// * `selector` - Shared choice of transport, switched by failover.
    /// * `monitor` - Receives the outcome of every attempt.
    pub fn new(
        config: &ScoringConfig,
        scorer: RemoteScorerArc,
        selector: Arc<TransportSelector>,
        monitor: Arc<ProtocolHealthMonitor>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_max_entries)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();
        Self {
            scorer,
            selector,
            monitor,
            cache,
            retry_max: config.retry_max.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            // The HTTP client enforces its own timeouts; this bounds any scorer.
            attempt_timeout: config.connect_timeout() + config.request_timeout(),
        }
    }

    pub async fn score(&self, txn_id: TxnId, features: &FeatureSet) -> Result<ScoringResult> {
        if let Some(mut hit) = self.cache.get(&txn_id) {
            crate::metrics::record_scoring_cache_hit();
            hit.cached = true;
            return Ok(hit);
        }

        let request = ScoreRequest { txn_id, features };
        let mut last_failure = ScoringFailure::Timeout;

        for attempt in 1..=self.retry_max {
            let transport = self.selector.current();
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.attempt_timeout, self.scorer.score(transport, &request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ScoringFailure::Timeout),
            };
            let outcome = outcome.and_then(|response| {
                if response.score.is_nan() {
                    Err(ScoringFailure::Decode("score is NaN".to_string()))
                } else {
                    Ok(response)
                }
            });
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    self.monitor.record_success(elapsed_ms);
                    crate::metrics::record_scoring_call(transport, true, elapsed_ms);
                    let result = ScoringResult {
                        txn_id,
                        score: response.score.clamp(0.0, 1.0),
                        latency_ms: response.latency_ms.unwrap_or(elapsed_ms),
                        risk_details: response.risk_details,
                        cached: false,
                    };
                    self.cache.insert(txn_id, result.clone());
                    return Ok(result);
                }
                Err(failure) => {
                    self.monitor.record_failure(&failure, elapsed_ms);
                    crate::metrics::record_scoring_call(transport, false, elapsed_ms);
                    tracing::warn!(
                        %txn_id,
                        attempt,
                        transport = %transport,
                        kind = failure.kind(),
                        error = %failure,
                        "scoring attempt failed"
                    );
                    last_failure = failure;
                    if attempt < self.retry_max {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }

        Err(GatewayError::ScoringUnavailable(format!(
            "{} attempts exhausted, last error: {}",
            self.retry_max, last_failure
        )))
    }
}
