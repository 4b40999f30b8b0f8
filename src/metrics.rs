//! Counters and histograms published through the `metrics` facade.
//!
//! No recorder is installed by the crate; the embedding process decides where
//! these go.

use crate::domain::decision::Action;
use crate::domain::scoring::Transport;
use metrics::{counter, gauge, histogram};

pub fn record_admission(outcome: &'static str) {
    counter!("fraudgate_admission_total", "outcome" => outcome).increment(1);
}

pub fn record_in_flight(in_flight: usize, buffered: usize) {
    gauge!("fraudgate_in_flight").set(in_flight as f64);
    gauge!("fraudgate_buffered").set(buffered as f64);
}

pub fn record_decision(action: Action, latency_ms: u64) {
    counter!("fraudgate_decisions_total", "action" => action.as_str()).increment(1);
    histogram!("fraudgate_pipeline_latency_ms").record(latency_ms as f64);
}

pub fn record_scoring_call(transport: Transport, success: bool, duration_ms: u64) {
    counter!(
        "fraudgate_scoring_calls_total",
        "transport" => transport.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    histogram!("fraudgate_scoring_latency_ms").record(duration_ms as f64);
}

pub fn record_scoring_cache_hit() {
    counter!("fraudgate_scoring_cache_hits_total").increment(1);
}

pub fn record_failover(from: Transport, to: Transport) {
    counter!(
        "fraudgate_failovers_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_breaker_transition(state: &'static str) {
    counter!("fraudgate_breaker_transitions_total", "state" => state).increment(1);
}

pub fn record_features_degraded() {
    counter!("fraudgate_features_degraded_total").increment(1);
}

pub fn record_velocity_write_failure() {
    counter!("fraudgate_velocity_write_failures_total").increment(1);
}

pub fn record_persistence_failure(operation: &'static str) {
    counter!("fraudgate_persistence_failures_total", "operation" => operation).increment(1);
}
