use crate::config::FailoverConfig;
use crate::domain::ports::StabilityProbeArc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StabilityStatus {
    Stable,
    Testing,
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StabilitySnapshot {
    pub status: StabilityStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    pub successful_probes: u64,
}

/// Tracks consecutive probe outcomes independently of live traffic, so a
/// failed-over transport can be re-promoted once the network has settled.
pub struct NetworkStabilityMonitor {
    success_threshold: u32,
    failure_threshold: u32,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
    total_probes: AtomicU64,
    successful_probes: AtomicU64,
}

impl NetworkStabilityMonitor {
    pub fn new(config: &FailoverConfig) -> Self {
        Self {
            success_threshold: config.stability_success_threshold,
            failure_threshold: config.stability_failure_threshold,
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_probes: AtomicU64::new(0),
            successful_probes: AtomicU64::new(0),
        }
    }

    pub fn record(&self, success: bool) {
        self.total_probes.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_probes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes == self.success_threshold {
                tracing::info!(successes, "network stability restored");
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures == self.failure_threshold {
                tracing::warn!(failures, "network stability degraded");
            }
        }
    }

    pub fn status(&self) -> StabilityStatus {
        if self.consecutive_successes.load(Ordering::Relaxed) >= self.success_threshold {
            StabilityStatus::Stable
        } else if self.consecutive_failures.load(Ordering::Relaxed) >= self.failure_threshold {
            StabilityStatus::Unstable
        } else {
            StabilityStatus::Testing
        }
    }

    pub fn is_stable(&self) -> bool {
        self.status() == StabilityStatus::Stable
    }

    /// Looser than [`is_stable`](Self::is_stable): half the success threshold
    /// (at least two) and no run of failures.
    pub fn stable_for_retry(&self) -> bool {
        let required = (self.success_threshold / 2).max(2);
        self.consecutive_successes.load(Ordering::Relaxed) >= required
            && self.consecutive_failures.load(Ordering::Relaxed) < self.failure_threshold
    }

    pub fn snapshot(&self) -> StabilitySnapshot {
        StabilitySnapshot {
            status: self.status(),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_probes: self.total_probes.load(Ordering::Relaxed),
            successful_probes: self.successful_probes.load(Ordering::Relaxed),
        }
    }

    /// Probes every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, probe: StabilityProbeArc, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let success = probe.probe().await;
                self.record(success);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::domain::ports::StabilityProbe;

    fn monitor() -> NetworkStabilityMonitor {
        NetworkStabilityMonitor::new(&FailoverConfig::default())
    }

    #[test]
    fn test_retry_needs_two_successes_with_default_threshold() {
        let monitor = monitor();
        monitor.record(true);
        assert!(!monitor.stable_for_retry());
        monitor.record(true);
        assert!(monitor.stable_for_retry());
        assert_eq!(monitor.status(), StabilityStatus::Testing);
    }

    #[test]
    fn test_failure_resets_success_run() {
        let monitor = monitor();
        for _ in 0..5 {
            monitor.record(true);
        }
        assert!(monitor.is_stable());
        monitor.record(false);
        assert!(!monitor.stable_for_retry());
        monitor.record(false);
        monitor.record(false);
        assert_eq!(monitor.status(), StabilityStatus::Unstable);
        assert_eq!(monitor.snapshot().total_probes, 8);
    }

    struct AlwaysUp;

    #[async_trait]
    impl StabilityProbe for AlwaysUp {
        async fn probe(&self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_probe_loop() {
        let monitor = Arc::new(monitor());
        let handle = monitor.clone().spawn(Arc::new(AlwaysUp), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(45)).await;
        handle.abort();

        assert!(monitor.is_stable());
    }
}
