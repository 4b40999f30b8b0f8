use crate::application::pipeline::{PipelineOrchestrator, Pool};
use crate::config::AdmissionConfig;
use crate::domain::transaction::Transaction;
use crate::error::RejectReason;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};

type GlobalRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Called once per finished pipeline run, successful or not.
pub type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// A claimed concurrency slot. Dropping it frees the slot and fires the
/// completion hook.
pub struct AdmissionSlot {
    in_flight: Option<Arc<AtomicUsize>>,
    hook: Option<CompletionHook>,
}

impl AdmissionSlot {
    /// A slot for work that is bounded elsewhere (drained batches) but still
    /// reports completion.
    fn detached(hook: Option<CompletionHook>) -> Self {
        Self { in_flight: None, hook }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(hook) = &self.hook {
            hook();
        }
    }
}

pub enum Admission {
    /// Run now; the slot goes to the pipeline run and is freed when it ends.
    Proceed(AdmissionSlot, Transaction),
    /// Parked in the overflow buffer for the drain loop.
    Queued,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub buffered: usize,
    pub buffer_capacity: usize,
    pub admitted: u64,
    pub queued: u64,
    pub rejected: u64,
}

/// Front gate of the gateway.
///
/// A global token bucket runs first and turns excess traffic away before any
/// other work. Below the rate ceiling a lock-free in-flight counter caps
/// concurrent pipelines; once it is saturated transactions go to a bounded
/// overflow buffer, and only when that is full too are they rejected.
pub struct AdmissionController {
    limiter: Option<GlobalRateLimiter>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    buffer: Option<mpsc::Sender<Transaction>>,
    drain: Mutex<Option<mpsc::Receiver<Transaction>>>,
    draining: AtomicBool,
    batch_drain_size: usize,
    drain_interval: Duration,
    hook: Option<CompletionHook>,
    admitted: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        let limiter = NonZeroU32::new(config.rate_limit_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        let (buffer, drain) = if config.buffer_size > 0 {
            let (tx, rx) = mpsc::channel(config.buffer_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Self {
            limiter,
            max_concurrent: config.max_concurrent_requests,
            in_flight: Arc::new(AtomicUsize::new(0)),
            buffer,
            drain: Mutex::new(drain),
            draining: AtomicBool::new(false),
            batch_drain_size: config.batch_drain_size.max(1),
            drain_interval: Duration::from_millis(config.drain_interval_ms.max(1)),
            hook: None,
            admitted: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Decides whether `tx` runs now, waits in the buffer or is turned away.
    ///
    /// # Arguments
    ///
    /// * `tx` - The transaction asking for a slot. Returned inside
    ///   [`Admission::Proceed`] so the caller can hand both to the pipeline.
    pub fn admit(&self, tx: Transaction) -> Admission {
        if let Some(limiter) = &self.limiter
            && limiter.check().is_err()
        {
            return self.reject(RejectReason::RateLimited);
        }

        if let Some(slot) = self.try_acquire() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_admission("proceed");
            return Admission::Proceed(slot, tx);
        }

        let Some(buffer) = &self.buffer else {
            return self.reject(RejectReason::OverCapacity);
        };
        match buffer.try_send(tx) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_admission("queued");
                Admission::Queued
            }
            Err(TrySendError::Full(tx)) | Err(TrySendError::Closed(tx)) => {
                tracing::warn!(txn_id = %tx.txn_id, "overflow buffer full, rejecting");
                self.reject(RejectReason::OverCapacity)
            }
        }
    }

    fn reject(&self, reason: RejectReason) -> Admission {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_admission(match reason {
            RejectReason::RateLimited => "rate_limited",
            RejectReason::OverCapacity => "over_capacity",
        });
        Admission::Rejected(reason)
    }

    fn try_acquire(&self) -> Option<AdmissionSlot> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_concurrent {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(AdmissionSlot {
                        in_flight: Some(self.in_flight.clone()),
                        hook: self.hook.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer
            .as_ref()
            .map(|b| b.max_capacity() - b.capacity())
            .unwrap_or(0)
    }

    /// Nothing buffered and no drained batch still running.
    pub fn is_idle(&self) -> bool {
        self.buffered() == 0 && !self.draining.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AdmissionStats {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        let buffered = self.buffered();
        crate::metrics::record_in_flight(in_flight, buffered);
        AdmissionStats {
            in_flight,
            max_concurrent: self.max_concurrent,
            buffered,
            buffer_capacity: self.buffer.as_ref().map(|b| b.max_capacity()).unwrap_or(0),
            admitted: self.admitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Starts the drain loop. Returns `None` if it is already running or there
    /// is no overflow buffer.
    ///
    /// Every interval the loop takes up to `batch_drain_size` buffered
    /// transactions, runs them on the batch pool and waits for the whole batch
    /// before sleeping again.
    pub fn spawn_drain(self: &Arc<Self>, pipeline: Arc<PipelineOrchestrator>) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        let controller = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if receiver.is_empty() {
                    if receiver.is_closed() {
                        break;
                    }
                    continue;
                }
                // Set before the receive so the buffer never looks empty while
                // its transactions are still unprocessed.
                controller.draining.store(true, Ordering::SeqCst);
                let mut batch = Vec::with_capacity(controller.batch_drain_size);
                if receiver.recv_many(&mut batch, controller.batch_drain_size).await == 0 {
                    controller.draining.store(false, Ordering::SeqCst);
                    break;
                }
                controller.run_batch(batch, &pipeline).await;
                controller.draining.store(false, Ordering::SeqCst);
            }
            tracing::debug!("admission drain loop stopped");
        }))
    }

    async fn run_batch(&self, batch: Vec<Transaction>, pipeline: &Arc<PipelineOrchestrator>) {
        let size = batch.len();
        let mut tasks = JoinSet::new();
        for tx in batch {
            let pipeline = pipeline.clone();
            let slot = AdmissionSlot::detached(self.hook.clone());
            tasks.spawn(async move { pipeline.process(tx, Pool::Batch, Some(slot)).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "drained transaction task failed");
            }
        }
        tracing::debug!(size, remaining = self.buffered(), "drained overflow batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::{TransactionRequest, TxnId};
    use std::collections::BTreeMap;

    fn config(max_concurrent: usize, buffer: usize, rate: u32) -> AdmissionConfig {
        AdmissionConfig {
            max_concurrent_requests: max_concurrent,
            buffer_size: buffer,
            batch_drain_size: 10,
            drain_interval_ms: 100,
            rate_limit_per_second: rate,
        }
    }

    fn tx(id: u64) -> Transaction {
        TransactionRequest {
            txn_id: None,
            merchant_id: "m".to_string(),
            terminal_id: None,
            amount_minor_units: 100,
            currency: "USD".to_string(),
            card_pan: "4000000000000002".to_string(),
            emv_tags: BTreeMap::new(),
            acquirer_response: None,
            timestamp: None,
        }
        .into_transaction(TxnId(id), chrono::Utc::now())
        .unwrap()
    }

    #[test]
    fn test_saturation_queues_then_rejects() {
        let controller = AdmissionController::new(&config(2, 1, 0));

        let a = controller.admit(tx(1));
        let b = controller.admit(tx(2));
        assert!(matches!(a, Admission::Proceed(..)));
        assert!(matches!(b, Admission::Proceed(..)));
        assert!(matches!(controller.admit(tx(3)), Admission::Queued));
        assert!(matches!(
            controller.admit(tx(4)),
            Admission::Rejected(RejectReason::OverCapacity)
        ));

        let stats = controller.stats();
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.buffered, 1);
        assert_eq!(stats.rejected, 1);

        drop(a);
        assert_eq!(controller.stats().in_flight, 1);
        assert!(matches!(controller.admit(tx(5)), Admission::Proceed(..)));
    }

    #[test]
    fn test_no_buffer_rejects_on_saturation() {
        let controller = AdmissionController::new(&config(1, 0, 0));
        let _slot = controller.admit(tx(1));
        assert!(matches!(
            controller.admit(tx(2)),
            Admission::Rejected(RejectReason::OverCapacity)
        ));
        assert_eq!(controller.stats().buffer_capacity, 0);
    }

    #[test]
    fn test_rate_limit_applies_first() {
        let controller = AdmissionController::new(&config(100, 100, 1));
        let _first = controller.admit(tx(1));
        assert!(matches!(
            controller.admit(tx(2)),
            Admission::Rejected(RejectReason::RateLimited)
        ));
        assert_eq!(controller.stats().in_flight, 1);
        assert_eq!(controller.stats().queued, 0);
    }

    #[test]
    fn test_completion_hook_fires_on_drop() {
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let controller = AdmissionController::new(&config(4, 4, 0))
            .with_completion_hook(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        for id in 0..3 {
            let admission = controller.admit(tx(id));
            drop(admission);
        }
        assert_eq!(completed.load(Ordering::SeqCst), 3);
        assert_eq!(controller.stats().in_flight, 0);
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_cap() {
        let controller = Arc::new(AdmissionController::new(&config(50, 0, 0)));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let controller = controller.clone();
            handles.push(std::thread::spawn(move || {
                let mut slots = Vec::new();
                for i in 0..20 {
                    if let Admission::Proceed(slot, _) = controller.admit(tx(t * 100 + i)) {
                        slots.push(slot);
                    }
                }
                slots
            }));
        }
        // Keep every slot alive until all threads are done admitting.
        let held: Vec<Vec<AdmissionSlot>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(held.iter().map(Vec::len).sum::<usize>(), 50);
        assert_eq!(controller.stats().rejected, 160 - 50);
    }
}
