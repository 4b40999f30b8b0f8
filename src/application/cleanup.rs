use crate::application::admission::CompletionHook;
use crate::domain::ports::VelocityStoreArc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub completed_transactions: u64,
    pub sweeps: u64,
    pub evicted_keys: u64,
}

/// Post-transaction bookkeeping and the periodic velocity sweep.
pub struct CleanupService {
    velocity: VelocityStoreArc,
    interval: Duration,
    completed: AtomicU64,
    sweeps: AtomicU64,
    evicted: AtomicU64,
}

impl CleanupService {
    pub fn new(velocity: VelocityStoreArc, interval: Duration) -> Self {
        Self {
            velocity,
            interval,
            completed: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Hook for [`AdmissionController::with_completion_hook`](crate::application::admission::AdmissionController::with_completion_hook).
    pub fn completion_hook(self: &Arc<Self>) -> CompletionHook {
        let service = self.clone();
        Arc::new(move || {
            service.completed.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Evicts expired velocity keys once. Failures are logged and count as zero.
    pub async fn sweep(&self) -> usize {
        let sweeps = self.sweeps.fetch_add(1, Ordering::Relaxed) + 1;
        match self.velocity.purge_expired().await {
            Ok(evicted) => {
                self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
                if evicted > 0 || sweeps % 10 == 0 {
                    tracing::debug!(evicted, sweeps, "velocity sweep");
                }
                evicted
            }
            Err(e) => {
                tracing::warn!(error = %e, "velocity sweep failed");
                0
            }
        }
    }

    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            completed_transactions: self.completed.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            evicted_keys: self.evicted.load(Ordering::Relaxed),
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately; nothing can have expired yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::VelocityStore;
    use crate::domain::transaction::CardFingerprint;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryVelocityStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_sweep_evicts_expired_counters() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let store = Arc::new(InMemoryVelocityStore::new(Arc::new(clock.clone())));
        let card = CardFingerprint::from_pan("4111111111111111");
        store.record(&card, "m-1", 500, Some("t-1")).await.unwrap();
        let before = store.key_count();

        let service = CleanupService::new(store.clone(), Duration::from_secs(30));
        assert_eq!(service.sweep().await, 0);

        clock.advance(chrono::Duration::days(40));
        let evicted = service.sweep().await;

        assert!(evicted > 0);
        assert!(store.key_count() < before);
        let stats = service.stats();
        assert_eq!(stats.sweeps, 2);
        assert_eq!(stats.evicted_keys, evicted as u64);
    }

    #[test]
    fn test_completion_hook_counts() {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(InMemoryVelocityStore::new(Arc::new(clock)));
        let service = Arc::new(CleanupService::new(store, Duration::from_secs(30)));
        let hook = service.completion_hook();
        hook();
        hook();
        assert_eq!(service.stats().completed_transactions, 2);
    }
}
