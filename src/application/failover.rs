use crate::application::health::{HealthSnapshot, ProtocolHealthMonitor};
use crate::application::stability::{NetworkStabilityMonitor, StabilitySnapshot};
use crate::config::FailoverConfig;
use crate::domain::ports::{ClockArc, RemoteScorerArc};
use crate::domain::scoring::Transport;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const HTTP2: u8 = 0;
const HTTP1: u8 = 1;

/// The transport the scoring client should use right now.
///
/// Written only by the failover controller; read by the client on every call.
#[derive(Debug)]
pub struct TransportSelector(AtomicU8);

impl TransportSelector {
    pub fn new(initial: Transport) -> Self {
        let selector = Self(AtomicU8::new(HTTP2));
        selector.set(initial);
        selector
    }

    pub fn current(&self) -> Transport {
        match self.0.load(Ordering::Acquire) {
            HTTP2 => Transport::Http2,
            _ => Transport::Http1,
        }
    }

    fn set(&self, transport: Transport) {
        let raw = match transport {
            Transport::Http2 => HTTP2,
            Transport::Http1 => HTTP1,
        };
        self.0.store(raw, Ordering::Release);
    }
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::new(Transport::Http2)
    }
}

/// What a single controller tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    FailedOver,
    /// Failed over, but not yet eligible for a retry.
    Deferred,
    RetryFailed,
    Promoted,
}

#[derive(Debug, Default)]
struct FailoverState {
    active: bool,
    last_failover: Option<DateTime<Utc>>,
    last_retry: Option<DateTime<Utc>>,
    last_promotion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverStats {
    pub transport: String,
    pub failover_active: bool,
    pub failover_count: u64,
    pub last_failover: Option<DateTime<Utc>>,
    pub last_retry: Option<DateTime<Utc>>,
    pub last_promotion: Option<DateTime<Utc>>,
    pub health: HealthSnapshot,
    pub stability: StabilitySnapshot,
}

/// Downgrades the scorer transport when the health monitor asks for it and
/// re-promotes it once the network has been stable for long enough.
pub struct FailoverController {
    selector: Arc<TransportSelector>,
    monitor: Arc<ProtocolHealthMonitor>,
    stability: Arc<NetworkStabilityMonitor>,
    scorer: RemoteScorerArc,
    clock: ClockArc,
    retry_interval: Duration,
    min_retry_interval: Duration,
    check_interval: std::time::Duration,
    failover_count: AtomicU64,
    state: Mutex<FailoverState>,
}

impl FailoverController {
    /// Creates a new `FailoverController`.
    ///
    /// # Arguments
    ///
    /// * `config` - Retry intervals and stability gates for re-promotion.
    /// * `selector` - The transport switch shared with the scoring client.
    /// * `monitor` - Health of the current transport.
    /// * `stability` - Network stability, consulted before a retry.
    /// * `scorer` - Pinged on the preferred transport before re-promotion.
    /// * `clock` - Time source for the failover timestamps.
    pub fn new(
        config: &FailoverConfig,
        selector: Arc<TransportSelector>,
        monitor: Arc<ProtocolHealthMonitor>,
        stability: Arc<NetworkStabilityMonitor>,
        scorer: RemoteScorerArc,
        clock: ClockArc,
    ) -> Self {
        Self {
            selector,
            monitor,
            stability,
            scorer,
            clock,
            retry_interval: Duration::seconds(config.retry_interval_secs as i64),
            min_retry_interval: Duration::seconds(config.min_retry_interval_secs as i64),
            check_interval: std::time::Duration::from_secs(config.check_interval_secs.max(1)),
            failover_count: AtomicU64::new(0),
            state: Mutex::new(FailoverState::default()),
        }
    }

    pub fn current_transport(&self) -> Transport {
        self.selector.current()
    }

    /// One scheduled evaluation.
    pub async fn tick(&self) -> TickOutcome {
        let mut state = self.state.lock().await;
        if !state.active {
            if self.monitor.should_failover() {
                self.fail_over(&mut state);
                return TickOutcome::FailedOver;
            }
            return TickOutcome::Idle;
        }

        let now = self.clock.now();
        let since_failover_ok = state
            .last_failover
            .is_none_or(|at| now - at >= self.retry_interval);
        let since_retry_ok = state
            .last_retry
            .is_none_or(|at| now - at >= self.min_retry_interval);
        if !since_failover_ok || !since_retry_ok {
            return TickOutcome::Deferred;
        }
        if !self.stability.stable_for_retry() {
            let snapshot = self.stability.snapshot();
            tracing::debug!(
                consecutive_successes = snapshot.consecutive_successes,
                consecutive_failures = snapshot.consecutive_failures,
                "transport retry deferred, network not stable"
            );
            return TickOutcome::Deferred;
        }

        state.last_retry = Some(now);
        tracing::info!("network stable, attempting to restore {}", Transport::Http2);
        match self.scorer.ping(Transport::Http2).await {
            Ok(()) => {
                state.active = false;
                state.last_promotion = Some(now);
                self.selector.set(Transport::Http2);
                self.monitor.reset_metrics();
                tracing::info!("{} restored", Transport::Http2);
                TickOutcome::Promoted
            }
            Err(e) => {
                tracing::warn!(error = %e, "connectivity test failed, staying on {}", Transport::Http1);
                TickOutcome::RetryFailed
            }
        }
    }

    fn fail_over(&self, state: &mut FailoverState) {
        let from = self.selector.current();
        state.active = true;
        state.last_failover = Some(self.clock.now());
        self.selector.set(Transport::Http1);
        let count = self.failover_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.monitor.reset_metrics();
        crate::metrics::record_failover(from, Transport::Http1);
        tracing::error!(failover_count = count, "scorer transport unhealthy, switching {} -> {}", from, Transport::Http1);
    }

    pub async fn stats(&self) -> FailoverStats {
        let state = self.state.lock().await;
        FailoverStats {
            transport: self.selector.current().to_string(),
            failover_active: state.active,
            failover_count: self.failover_count.load(Ordering::Relaxed),
            last_failover: state.last_failover,
            last_retry: state.last_retry,
            last_promotion: state.last_promotion,
            health: self.monitor.snapshot(),
            stability: self.stability.snapshot(),
        }
    }

    /// Ticks on the configured interval, and immediately whenever the health
    /// monitor raises its alarm.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.monitor.alarm().notified() => {}
                }
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Clock, RemoteScorer};
    use crate::domain::scoring::{ScoreRequest, ScoreResponse, ScoringFailure};
    use crate::infrastructure::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicBool;

    struct PingScorer {
        up: AtomicBool,
    }

    #[async_trait]
    impl RemoteScorer for PingScorer {
        async fn score(
            &self,
            _: Transport,
            _: &ScoreRequest<'_>,
        ) -> Result<ScoreResponse, ScoringFailure> {
            Err(ScoringFailure::Timeout)
        }

        async fn ping(&self, _: Transport) -> Result<(), ScoringFailure> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ScoringFailure::Connection("refused".into()))
            }
        }
    }

    struct Fixture {
        controller: FailoverController,
        monitor: Arc<ProtocolHealthMonitor>,
        stability: Arc<NetworkStabilityMonitor>,
        scorer: Arc<PingScorer>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let config = FailoverConfig::default();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let monitor = Arc::new(ProtocolHealthMonitor::new(&config));
        let stability = Arc::new(NetworkStabilityMonitor::new(&config));
        let scorer = Arc::new(PingScorer {
            up: AtomicBool::new(true),
        });
        let controller = FailoverController::new(
            &config,
            Arc::new(TransportSelector::default()),
            monitor.clone(),
            stability.clone(),
            scorer.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            controller,
            monitor,
            stability,
            scorer,
            clock,
        }
    }

    async fn force_failover(f: &Fixture) {
        for _ in 0..10 {
            f.monitor.record_failure(&ScoringFailure::Timeout, 5);
        }
        assert_eq!(f.controller.tick().await, TickOutcome::FailedOver);
    }

    #[tokio::test]
    async fn test_drop_threshold_fails_over_and_resets_monitor() {
        let f = fixture();
        assert_eq!(f.controller.tick().await, TickOutcome::Idle);

        force_failover(&f).await;

        assert_eq!(f.controller.current_transport(), Transport::Http1);
        assert_eq!(f.monitor.snapshot().requests, 0);
        let stats = f.controller.stats().await;
        assert_eq!(stats.failover_count, 1);
        assert_eq!(stats.transport, "HTTP/1.1");
        assert_eq!(stats.last_failover, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_repromotion_waits_for_retry_interval_and_stability() {
        let f = fixture();
        force_failover(&f).await;
        f.stability.record(true);
        f.stability.record(true);

        f.clock.advance(Duration::seconds(299));
        assert_eq!(f.controller.tick().await, TickOutcome::Deferred);

        f.clock.advance(Duration::seconds(1));
        f.stability.record(false);
        assert_eq!(f.controller.tick().await, TickOutcome::Deferred);

        f.stability.record(true);
        f.stability.record(true);
        assert_eq!(f.controller.tick().await, TickOutcome::Promoted);
        assert_eq!(f.controller.current_transport(), Transport::Http2);
        assert!(!f.controller.stats().await.failover_active);
    }

    #[tokio::test]
    async fn test_failed_connectivity_test_keeps_fallback_and_resets_timer() {
        let f = fixture();
        force_failover(&f).await;
        f.stability.record(true);
        f.stability.record(true);
        f.scorer.up.store(false, Ordering::SeqCst);

        f.clock.advance(Duration::seconds(300));
        assert_eq!(f.controller.tick().await, TickOutcome::RetryFailed);
        assert_eq!(f.controller.current_transport(), Transport::Http1);

        // Within the minimum retry interval nothing is attempted.
        f.scorer.up.store(true, Ordering::SeqCst);
        f.clock.advance(Duration::seconds(59));
        assert_eq!(f.controller.tick().await, TickOutcome::Deferred);

        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.controller.tick().await, TickOutcome::Promoted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_triggers_immediate_tick() {
        let f = fixture();
        let controller = Arc::new(f.controller);
        let handle = controller.clone().spawn();
        // Let the first interval tick pass.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        for _ in 0..10 {
            f.monitor.record_failure(&ScoringFailure::Timeout, 5);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.abort();

        assert_eq!(controller.current_transport(), Transport::Http1);
    }
}
