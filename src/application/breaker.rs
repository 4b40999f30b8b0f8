use crate::config::BreakerConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub calls_in_window: usize,
    pub failure_rate: f64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Most recent outcomes while CLOSED, `true` for failure.
    window: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    trials_started: u32,
    trial_successes: u32,
}

impl Inner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.window.len() as f64
        }
    }
}

/// One call let through the breaker.
#[must_use = "an unsettled permit is recorded as a failure"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}

/// Count-based circuit breaker around the scoring stage.
///
/// CLOSED records outcomes in a sliding window and opens once at least
/// `minimum_calls` outcomes are present and the failure ratio reaches the
/// threshold. OPEN rejects until the cooldown elapses, then HALF_OPEN lets a
/// fixed number of trial calls through: all must succeed to close again, and
/// any failure re-opens.
pub struct CircuitBreaker {
    config: BreakerConfig,
    cooldown: Duration,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.open_cooldown_ms),
            config,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = self.state();
        if from == to {
            return;
        }
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    from = from.as_str(),
                    failure_rate = inner.failure_rate(),
                    "scoring circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                inner.trials_started = 0;
                inner.trial_successes = 0;
                tracing::info!("scoring circuit breaker half-open");
            }
            BreakerState::Closed => {
                tracing::info!("scoring circuit breaker closed");
            }
        }
        inner.window.clear();
        inner.failures = 0;
        self.state.store(to.as_u8(), Ordering::Release);
        crate::metrics::record_breaker_transition(to.as_str());
    }

    /// Lets a call through if the current state allows it. The returned
    /// permit must be settled with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]; a permit dropped unsettled, for instance by
    /// a panicking call, counts as a failure.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        if self.state() == BreakerState::Closed {
            return Some(BreakerPermit::new(self));
        }
        let mut inner = self.lock();
        match self.state() {
            BreakerState::Closed => Some(BreakerPermit::new(self)),
            BreakerState::Open => {
                let cooled = inner.opened_at.is_none_or(|at| at.elapsed() >= self.cooldown);
                if !cooled {
                    return None;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.trials_started = 1;
                Some(BreakerPermit::new(self))
            }
            BreakerState::HalfOpen => {
                if inner.trials_started < self.config.half_open_permits {
                    inner.trials_started += 1;
                    Some(BreakerPermit::new(self))
                } else {
                    None
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.record(false);
    }

    pub fn record_failure(&self) {
        self.record(true);
    }

    fn record(&self, failed: bool) {
        let mut inner = self.lock();
        match self.state() {
            BreakerState::Closed => {
                inner.window.push_back(failed);
                if failed {
                    inner.failures += 1;
                }
                while inner.window.len() > self.config.window_size as usize {
                    if inner.window.pop_front() == Some(true) {
                        inner.failures -= 1;
                    }
                }
                if inner.window.len() >= self.config.minimum_calls as usize
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                if failed {
                    self.transition(&mut inner, BreakerState::Open);
                } else {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.half_open_permits {
                        self.transition(&mut inner, BreakerState::Closed);
                    }
                }
            }
            // Late outcome of a call admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: self.state(),
            calls_in_window: inner.window.len(),
            failure_rate: inner.failure_rate(),
        }
    }
}
