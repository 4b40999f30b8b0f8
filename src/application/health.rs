use crate::config::FailoverConfig;
use crate::domain::scoring::ScoringFailure;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub requests: u64,
    pub errors: u64,
    pub drops: u64,
    pub consecutive_drops: u32,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

/// Health of the preferred scorer transport, fed by the scoring client.
///
/// Counters accumulate until [`reset_metrics`](Self::reset_metrics), which the
/// failover controller calls whenever it switches transport. When a failure
/// pushes the monitor past its failover condition the [`alarm`](Self::alarm)
/// is raised so the controller does not have to wait for its next tick.
pub struct ProtocolHealthMonitor {
    drop_threshold: u32,
    error_rate_threshold: f64,
    latency_threshold_ms: u64,
    requests: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
    consecutive_drops: AtomicU32,
    total_latency_ms: AtomicU64,
    alarm: Notify,
}

impl ProtocolHealthMonitor {
    pub fn new(config: &FailoverConfig) -> Self {
        Self {
            drop_threshold: config.drop_threshold,
            error_rate_threshold: config.error_rate_threshold,
            latency_threshold_ms: config.latency_threshold_ms,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            consecutive_drops: AtomicU32::new(0),
            total_latency_ms: AtomicU64::new(0),
            alarm: Notify::new(),
        }
    }

    pub fn alarm(&self) -> &Notify {
        &self.alarm
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.consecutive_drops.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, failure: &ScoringFailure, latency_ms: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if failure.is_drop() {
            self.drops.fetch_add(1, Ordering::Relaxed);
            let consecutive = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
            if consecutive == self.drop_threshold {
                tracing::warn!(consecutive_drops = consecutive, "scorer transport reached drop threshold");
            }
        }
        if self.should_failover() {
            self.alarm.notify_one();
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.consecutive_drops.load(Ordering::Relaxed) >= self.drop_threshold {
            return HealthStatus::Critical;
        }
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return HealthStatus::Healthy;
        }
        let error_rate = self.errors.load(Ordering::Relaxed) as f64 / requests as f64;
        let avg_latency = self.total_latency_ms.load(Ordering::Relaxed) as f64 / requests as f64;
        if error_rate >= self.error_rate_threshold || avg_latency > self.latency_threshold_ms as f64 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// CRITICAL, or DEGRADED with at least half the drop threshold in a row.
    pub fn should_failover(&self) -> bool {
        match self.status() {
            HealthStatus::Critical => true,
            HealthStatus::Degraded => {
                self.consecutive_drops.load(Ordering::Relaxed) >= self.drop_threshold / 2
            }
            HealthStatus::Healthy => false,
        }
    }

    pub fn reset_metrics(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.drops.store(0, Ordering::Relaxed);
        self.consecutive_drops.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let ratio = |n: u64| if requests == 0 { 0.0 } else { n as f64 / requests as f64 };
        HealthSnapshot {
            status: self.status(),
            requests,
            errors,
            drops: self.drops.load(Ordering::Relaxed),
            consecutive_drops: self.consecutive_drops.load(Ordering::Relaxed),
            error_rate: ratio(errors),
            avg_latency_ms: ratio(self.total_latency_ms.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ProtocolHealthMonitor {
        ProtocolHealthMonitor::new(&FailoverConfig::default())
    }

    #[test]
    fn test_drop_threshold_makes_status_critical() {
        let monitor = monitor();
        for _ in 0..9 {
            monitor.record_failure(&ScoringFailure::Timeout, 150);
        }
        assert_eq!(monitor.status(), HealthStatus::Degraded);
        monitor.record_failure(&ScoringFailure::Connection("reset".into()), 1);
        assert_eq!(monitor.status(), HealthStatus::Critical);
        assert!(monitor.should_failover());
    }

    #[test]
    fn test_success_resets_consecutive_drops() {
        let monitor = monitor();
        for _ in 0..9 {
            monitor.record_failure(&ScoringFailure::Timeout, 10);
        }
        monitor.record_success(10);
        monitor.record_failure(&ScoringFailure::Timeout, 10);
        assert_eq!(monitor.snapshot().consecutive_drops, 1);
        assert_ne!(monitor.status(), HealthStatus::Critical);
    }

    #[test]
    fn test_degraded_fails_over_only_with_half_the_drops() {
        let monitor = monitor();
        for _ in 0..10 {
            monitor.record_success(5);
        }
        // Application errors degrade but are not drops.
        monitor.record_failure(&ScoringFailure::Status(500), 5);
        assert_eq!(monitor.status(), HealthStatus::Degraded);
        assert!(!monitor.should_failover());

        for _ in 0..5 {
            monitor.record_failure(&ScoringFailure::Timeout, 5);
        }
        assert_eq!(monitor.status(), HealthStatus::Degraded);
        assert!(monitor.should_failover());
    }

    #[test]
    fn test_slow_responses_degrade() {
        let monitor = monitor();
        monitor.record_success(2_500);
        monitor.record_success(100);
        assert_eq!(monitor.status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_reset_returns_to_healthy() {
        let monitor = monitor();
        for _ in 0..12 {
            monitor.record_failure(&ScoringFailure::Timeout, 10);
        }
        assert_eq!(monitor.status(), HealthStatus::Critical);
        monitor.reset_metrics();
        assert_eq!(monitor.status(), HealthStatus::Healthy);
        assert_eq!(monitor.snapshot().requests, 0);
    }
}
