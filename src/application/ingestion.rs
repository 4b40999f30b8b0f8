use crate::application::admission::{Admission, AdmissionController};
use crate::application::pipeline::{PipelineOrchestrator, PipelineResponse, Pool};
use crate::domain::ports::{ClockArc, PersistenceGatewayArc};
use crate::domain::transaction::{Transaction, TransactionRequest, TxnId};
use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinSet;

/// Result of handing one request to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestOutcome {
    /// Scored and decided while the caller waited.
    Decided(PipelineResponse),
    /// Accepted into the overflow buffer; the decision can be fetched later.
    Queued { txn_id: TxnId },
}

impl IngestOutcome {
    pub fn txn_id(&self) -> TxnId {
        match self {
            IngestOutcome::Decided(response) => response.txn_id,
            IngestOutcome::Queued { txn_id } => *txn_id,
        }
    }
}

/// Turns inbound requests into transactions and pushes them through
/// admission and the pipeline.
pub struct TransactionIngestor {
    next_id: AtomicU64,
    persistence: PersistenceGatewayArc,
    admission: Arc<AdmissionController>,
    pipeline: Arc<PipelineOrchestrator>,
    clock: ClockArc,
}

impl TransactionIngestor {
    /// Continues id assignment after the highest id already persisted.
    pub async fn new(
        persistence: PersistenceGatewayArc,
        admission: Arc<AdmissionController>,
        pipeline: Arc<PipelineOrchestrator>,
        clock: ClockArc,
    ) -> Result<Self> {
        let last = persistence.max_txn_id().await?.map_or(0, |id| id.0);
        Ok(Self {
            next_id: AtomicU64::new(last + 1),
            persistence,
            admission,
            pipeline,
            clock,
        })
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn pipeline(&self) -> &Arc<PipelineOrchestrator> {
        &self.pipeline
    }

    fn assign_id(&self, requested: Option<u64>) -> TxnId {
        match requested {
            Some(id) => {
                self.next_id.fetch_max(id.saturating_add(1), Ordering::AcqRel);
                TxnId(id)
            }
            None => TxnId(self.next_id.fetch_add(1, Ordering::AcqRel)),
        }
    }

    /// Validates, stores and admits one request.
    ///
    /// # Arguments
    ///
    /// * `request` - The inbound transaction. A caller-supplied `txn_id` that
    ///   already has a decision is answered from it without re-running anything.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for malformed requests and
    /// `AdmissionRejected` when the gateway is rate limited or full.
    pub async fn ingest(&self, request: TransactionRequest) -> Result<IngestOutcome> {
        let txn_id = self.assign_id(request.txn_id);

        // A replayed id is answered from the recorded decision.
        if request.txn_id.is_some()
            && let Ok(Some(existing)) = self.pipeline.decisions().find(txn_id).await
        {
            return Ok(IngestOutcome::Decided(PipelineResponse::from_decision(existing, 0)));
        }

        let tx = request.into_transaction(txn_id, self.clock.now())?;
        let record = tx.clone();

        match self.admission.admit(tx) {
            Admission::Rejected(reason) => {
                tracing::debug!(%txn_id, %reason, "transaction rejected");
                Err(GatewayError::AdmissionRejected(reason))
            }
            Admission::Queued => {
                self.persist(&record).await;
                tracing::debug!(%txn_id, "transaction buffered");
                Ok(IngestOutcome::Queued { txn_id })
            }
            Admission::Proceed(slot, tx) => {
                self.persist(&record).await;
                let response = self.pipeline.process(tx, Pool::Interactive, Some(slot)).await;
                Ok(IngestOutcome::Decided(response))
            }
        }
    }

    /// Ingests every request concurrently. Results keep the input order.
    pub async fn ingest_batch(self: &Arc<Self>, requests: Vec<TransactionRequest>) -> Vec<Result<IngestOutcome>> {
        let count = requests.len();
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let ingestor = self.clone();
            tasks.spawn(async move { (index, ingestor.ingest(request).await) });
        }

        let mut results: Vec<Option<Result<IngestOutcome>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "batch ingestion task failed"),
            }
        }
        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(GatewayError::InternalError("ingestion task aborted".into()))
                })
            })
            .collect()
    }

    async fn persist(&self, tx: &Transaction) {
        if let Err(e) = self.persistence.save_transaction(tx).await {
            let err = GatewayError::PersistenceFailure(e.to_string());
            tracing::error!(txn_id = %tx.txn_id, error = %err, "continuing without stored transaction");
            crate::metrics::record_persistence_failure("save_transaction");
        }
    }
}
