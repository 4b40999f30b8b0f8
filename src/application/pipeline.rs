use crate::application::admission::AdmissionSlot;
use crate::application::breaker::{BreakerStats, CircuitBreaker};
use crate::application::decision::DecisionEngine;
use crate::application::extractor::FeatureExtractor;
use crate::application::scoring::ScoringClient;
use crate::config::PipelineConfig;
use crate::domain::decision::{Action, Decision};
use crate::domain::ports::VelocityStoreArc;
use crate::domain::transaction::{Transaction, TxnId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Which worker pool runs a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Requests with a caller waiting on the answer.
    Interactive,
    /// Overflow drained from the admission buffer, and replays.
    Batch,
}

/// What the caller gets back for a scored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub txn_id: TxnId,
    pub score: f64,
    pub action: Action,
    pub reasons: Vec<String>,
    pub latency_ms: u64,
}

impl PipelineResponse {
    pub fn from_decision(decision: Decision, latency_ms: u64) -> Self {
        Self {
            txn_id: decision.txn_id,
            score: decision.score,
            action: decision.action,
            reasons: decision.reasons,
            latency_ms,
        }
    }

    fn fail_open(txn_id: TxnId, reason: String, latency_ms: u64) -> Self {
        Self {
            txn_id,
            score: 0.0,
            action: Action::Allow,
            reasons: vec![reason],
            latency_ms,
        }
    }
}

struct Stages {
    extractor: FeatureExtractor,
    velocity: VelocityStoreArc,
    scoring: ScoringClient,
    breaker: CircuitBreaker,
    decisions: Arc<DecisionEngine>,
    velocity_write_timeout: Duration,
}

impl Stages {
    async fn run(&self, tx: Transaction, started: Instant) -> PipelineResponse {
        let txn_id = tx.txn_id;
        match self.decisions.find(txn_id).await {
            Ok(Some(existing)) => {
                tracing::debug!(%txn_id, "already decided");
                return PipelineResponse::from_decision(existing, elapsed_ms(started));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%txn_id, error = %e, "decision lookup failed"),
        }

        let extraction = self.extractor.extract(&tx).await;
        self.record_velocity(&tx).await;

        let mut notes = Vec::new();
        if extraction.degraded {
            notes.push("Velocity features degraded".to_string());
        }
        let score = match self.breaker.try_acquire() {
            None => {
                notes.push("Scoring skipped: circuit breaker open (fail-open)".to_string());
                0.0
            }
            Some(permit) => match self.scoring.score(txn_id, &extraction.features).await {
                Ok(result) => {
                    permit.success();
                    result.score
                }
                Err(e) => {
                    permit.failure();
                    tracing::warn!(%txn_id, error = %e, "scoring failed, failing open");
                    notes.push(format!("{} (fail-open)", e));
                    0.0
                }
            },
        };

        let decision = self
            .decisions
            .evaluate(&tx, score, &extraction.features, notes)
            .await;
        let latency_ms = elapsed_ms(started);
        crate::metrics::record_decision(decision.action, latency_ms);
        PipelineResponse::from_decision(decision, latency_ms)
    }

    async fn record_velocity(&self, tx: &Transaction) {
        let write = self.velocity.record(
            &tx.card_fingerprint,
            &tx.merchant_id,
            tx.amount.minor_units(),
            tx.terminal_id.as_deref(),
        );
        let failure = match tokio::time::timeout(self.velocity_write_timeout, write).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        tracing::warn!(txn_id = %tx.txn_id, error = %failure, "velocity write dropped");
        crate::metrics::record_velocity_write_failure();
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Runs Features → Score → Decision for one transaction.
///
/// Each run is a spawned task holding a permit from its pool and, when given
/// one, the admission slot. A caller that goes away mid-flight therefore
/// neither leaves a half-written decision behind nor frees its slot early. Scoring
/// sits behind a circuit breaker and fails open to a zero score; the decision
/// rules still run on it.
pub struct PipelineOrchestrator {
    stages: Arc<Stages>,
    interactive: Arc<Semaphore>,
    batch: Arc<Semaphore>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        extractor: FeatureExtractor,
        velocity: VelocityStoreArc,
        scoring: ScoringClient,
        decisions: Arc<DecisionEngine>,
    ) -> Self {
        let stages = Stages {
            extractor,
            velocity,
            scoring,
            breaker: CircuitBreaker::new(config.breaker.clone()),
            decisions,
            velocity_write_timeout: Duration::from_millis(config.lookup_timeout_ms),
        };
        Self {
            stages: Arc::new(stages),
            interactive: Arc::new(Semaphore::new(config.interactive_workers)),
            batch: Arc::new(Semaphore::new(config.batch_workers)),
        }
    }

    pub fn decisions(&self) -> &Arc<DecisionEngine> {
        &self.stages.decisions
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.stages.breaker.stats()
    }

    /// Free permits in each pool, interactive first.
    pub fn available_workers(&self) -> (usize, usize) {
        (self.interactive.available_permits(), self.batch.available_permits())
    }

    /// Runs the pipeline for `tx` on `pool`.
    ///
    /// # Arguments
    ///
    /// * `tx` - The transaction to decide.
    /// * `pool` - Worker pool the run is charged to.
    /// * `slot` - Admission slot released when the run finishes or panics,
    ///   never earlier.
    pub async fn process(&self, tx: Transaction, pool: Pool, slot: Option<AdmissionSlot>) -> PipelineResponse {
        let started = Instant::now();
        let txn_id = tx.txn_id;
        let semaphore = match pool {
            Pool::Interactive => self.interactive.clone(),
            Pool::Batch => self.batch.clone(),
        };
        let stages = self.stages.clone();

        let handle = tokio::spawn(async move {
            let _slot = slot;
            let _permit = semaphore.acquire_owned().await.ok();
            stages.run(tx, started).await
        });

        match handle.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(%txn_id, error = %e, "pipeline task failed, failing open");
                PipelineResponse::fail_open(
                    txn_id,
                    format!("Pipeline failure: {} (fail-open)", e),
                    elapsed_ms(started),
                )
            }
        }
    }
}
