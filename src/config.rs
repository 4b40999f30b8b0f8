//! Gateway configuration.
//!
//! Static settings come from an optional TOML file where every field has a
//! default. Decision thresholds are additionally served at runtime through a
//! [`ConfigProvider`] so they can be changed without a restart.

use crate::domain::ports::ConfigProviderArc;
use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub scoring: ScoringConfig,
    pub failover: FailoverConfig,
    pub decision: DecisionConfig,
    pub pipeline: PipelineConfig,
    pub velocity: VelocityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent_requests: usize,
    pub buffer_size: usize,
    pub batch_drain_size: usize,
    pub drain_interval_ms: u64,
    /// Global ceiling in requests per second (0 = no limit).
    pub rate_limit_per_second: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub drop_threshold: u32,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: u64,
    pub retry_interval_secs: u64,
    pub min_retry_interval_secs: u64,
    pub check_interval_secs: u64,
    pub stability_success_threshold: u32,
    pub stability_failure_threshold: u32,
    pub stability_probe_interval_secs: u64,
    /// Endpoint probed for network stability. Defaults to the scorer itself.
    pub stability_probe_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub block_threshold: f64,
    pub hold_threshold: f64,
    /// Single-transaction AML threshold in minor units.
    pub aml_high_value_threshold: i64,
    pub aml_cumulative_multiplier: i64,
    pub blacklist_enabled: bool,
    /// Card fingerprints (SHA-256 hex) that are always blocked.
    pub blocked_cards: Vec<String>,
    pub blocked_terminals: Vec<String>,
    pub blocked_merchants: Vec<String>,
    /// Upper bound of the in-process decision ledger.
    pub ledger_max_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub interactive_workers: usize,
    pub batch_workers: usize,
    /// Bound on the joined parallel velocity lookups.
    pub feature_timeout_ms: u64,
    /// Bound on each lookup during the sequential re-run.
    pub lookup_timeout_ms: u64,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_rate_threshold: f64,
    pub minimum_calls: u32,
    pub window_size: u32,
    pub open_cooldown_ms: u64,
    pub half_open_permits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 30_000,
            buffer_size: 50_000,
            batch_drain_size: 500,
            drain_interval_ms: 100,
            rate_limit_per_second: 50_000,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8090".to_string(),
            connect_timeout_ms: 50,
            request_timeout_ms: 150,
            retry_max: 3,
            retry_backoff_ms: 100,
            cache_ttl_secs: 60,
            cache_max_entries: 100_000,
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            drop_threshold: 10,
            error_rate_threshold: 0.05,
            latency_threshold_ms: 1_000,
            retry_interval_secs: 300,
            min_retry_interval_secs: 60,
            check_interval_secs: 60,
            stability_success_threshold: 5,
            stability_failure_threshold: 3,
            stability_probe_interval_secs: 10,
            stability_probe_url: None,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            block_threshold: 0.95,
            hold_threshold: 0.7,
            aml_high_value_threshold: 1_000_000,
            aml_cumulative_multiplier: 10,
            blacklist_enabled: true,
            blocked_cards: Vec::new(),
            blocked_terminals: Vec::new(),
            blocked_merchants: Vec::new(),
            ledger_max_entries: 1_000_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interactive_workers: 512,
            batch_workers: 2_048,
            feature_timeout_ms: 50,
            lookup_timeout_ms: 20,
            breaker: BreakerConfig::default(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 20,
            window_size: 100,
            open_cooldown_ms: 5_000,
            half_open_permits: 5,
        }
    }
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
        }
    }
}

impl GatewayConfig {
    /// Loads the configuration from `path`, or defaults when no path is given.
    ///
    /// An unreadable or malformed file is logged and replaced by defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default().validated();
        };
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                    Self::default().validated()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default().validated()
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GatewayError::ConfigurationInvalid(e.to_string()))?;
        Ok(config.validated())
    }

    /// Replaces out-of-range values with their defaults, warning for each.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        if self.admission.max_concurrent_requests == 0 {
            warn_invalid("admission.max_concurrent_requests", &self.admission.max_concurrent_requests);
            self.admission.max_concurrent_requests = defaults.admission.max_concurrent_requests;
        }
        if self.admission.batch_drain_size == 0 {
            warn_invalid("admission.batch_drain_size", &self.admission.batch_drain_size);
            self.admission.batch_drain_size = defaults.admission.batch_drain_size;
        }
        if self.admission.drain_interval_ms == 0 {
            warn_invalid("admission.drain_interval_ms", &self.admission.drain_interval_ms);
            self.admission.drain_interval_ms = defaults.admission.drain_interval_ms;
        }
        if self.scoring.retry_max == 0 {
            warn_invalid("scoring.retry_max", &self.scoring.retry_max);
            self.scoring.retry_max = defaults.scoring.retry_max;
        }
        if self.failover.drop_threshold == 0 {
            warn_invalid("failover.drop_threshold", &self.failover.drop_threshold);
            self.failover.drop_threshold = defaults.failover.drop_threshold;
        }
        if !(0.0..=1.0).contains(&self.failover.error_rate_threshold) {
            warn_invalid("failover.error_rate_threshold", &self.failover.error_rate_threshold);
            self.failover.error_rate_threshold = defaults.failover.error_rate_threshold;
        }
        if !valid_thresholds(self.decision.block_threshold, self.decision.hold_threshold) {
            warn_invalid(
                "decision.block_threshold/hold_threshold",
                &format!("{}/{}", self.decision.block_threshold, self.decision.hold_threshold),
            );
            self.decision.block_threshold = defaults.decision.block_threshold;
            self.decision.hold_threshold = defaults.decision.hold_threshold;
        }
        if self.decision.aml_high_value_threshold <= 0 {
            warn_invalid("decision.aml_high_value_threshold", &self.decision.aml_high_value_threshold);
            self.decision.aml_high_value_threshold = defaults.decision.aml_high_value_threshold;
        }
        if self.decision.aml_cumulative_multiplier <= 0 {
            warn_invalid("decision.aml_cumulative_multiplier", &self.decision.aml_cumulative_multiplier);
            self.decision.aml_cumulative_multiplier = defaults.decision.aml_cumulative_multiplier;
        }
        if self.pipeline.interactive_workers == 0 {
            warn_invalid("pipeline.interactive_workers", &self.pipeline.interactive_workers);
            self.pipeline.interactive_workers = defaults.pipeline.interactive_workers;
        }
        if self.pipeline.batch_workers == 0 {
            warn_invalid("pipeline.batch_workers", &self.pipeline.batch_workers);
            self.pipeline.batch_workers = defaults.pipeline.batch_workers;
        }
        let breaker = &mut self.pipeline.breaker;
        if !(0.0..=1.0).contains(&breaker.failure_rate_threshold) || breaker.failure_rate_threshold == 0.0 {
            warn_invalid("pipeline.breaker.failure_rate_threshold", &breaker.failure_rate_threshold);
            breaker.failure_rate_threshold = defaults.pipeline.breaker.failure_rate_threshold;
        }
        if breaker.window_size == 0 || breaker.minimum_calls > breaker.window_size {
            warn_invalid("pipeline.breaker.window_size", &breaker.window_size);
            breaker.window_size = defaults.pipeline.breaker.window_size;
            breaker.minimum_calls = defaults.pipeline.breaker.minimum_calls;
        }
        if breaker.half_open_permits == 0 {
            warn_invalid("pipeline.breaker.half_open_permits", &breaker.half_open_permits);
            breaker.half_open_permits = defaults.pipeline.breaker.half_open_permits;
        }
        if self.velocity.sweep_interval_secs == 0 {
            warn_invalid("velocity.sweep_interval_secs", &self.velocity.sweep_interval_secs);
            self.velocity.sweep_interval_secs = defaults.velocity.sweep_interval_secs;
        }
        self
    }
}

impl ScoringConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn valid_thresholds(block: f64, hold: f64) -> bool {
    (0.0..=1.0).contains(&block) && (0.0..=1.0).contains(&hold) && hold <= block
}

fn warn_invalid(key: &str, value: &dyn std::fmt::Display) {
    let err = GatewayError::ConfigurationInvalid(format!("{key} = {value}"));
    tracing::warn!(error = %err, "using default");
}

pub const KEY_BLOCK_THRESHOLD: &str = "fraud.threshold.block";
pub const KEY_HOLD_THRESHOLD: &str = "fraud.threshold.hold";
pub const KEY_AML_HIGH_VALUE: &str = "aml.high_value_amount_minor";
pub const KEY_AML_CUMULATIVE_MULTIPLIER: &str = "aml.cumulative_multiplier";
pub const KEY_BLACKLIST_ENABLED: &str = "fraud.rule.blacklist.enabled";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Parsed {
    Float(f64),
    Int(i64),
    Bool(bool),
}

/// Typed, cached view over a [`ConfigProvider`](crate::domain::ports::ConfigProvider).
///
/// Values are parsed once and cached until [`ConfigService::update`] or
/// [`ConfigService::invalidate`] is called. Missing or malformed values fall
/// back to the defaults the service was built with.
pub struct ConfigService {
    provider: ConfigProviderArc,
    defaults: DecisionConfig,
    cache: DashMap<&'static str, Parsed>,
}

impl ConfigService {
    pub fn new(provider: ConfigProviderArc, defaults: DecisionConfig) -> Self {
        Self {
            provider,
            defaults,
            cache: DashMap::new(),
        }
    }

    /// Writes a value through to the provider and drops its cached parse.
    pub fn update(&self, key: &str, value: impl Into<String>) {
        self.provider.set(key, value.into());
        self.cache.remove(key);
    }

    /// Drops every cached value, e.g. after the provider was changed externally.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    pub fn block_threshold(&self) -> f64 {
        self.probability(KEY_BLOCK_THRESHOLD, self.defaults.block_threshold)
    }

    pub fn hold_threshold(&self) -> f64 {
        self.probability(KEY_HOLD_THRESHOLD, self.defaults.hold_threshold)
    }

    pub fn aml_high_value_threshold(&self) -> i64 {
        self.positive_int(KEY_AML_HIGH_VALUE, self.defaults.aml_high_value_threshold)
    }

    pub fn aml_cumulative_multiplier(&self) -> i64 {
        self.positive_int(KEY_AML_CUMULATIVE_MULTIPLIER, self.defaults.aml_cumulative_multiplier)
    }

    pub fn blacklist_enabled(&self) -> bool {
        if let Some(Parsed::Bool(v)) = self.cache.get(KEY_BLACKLIST_ENABLED).map(|e| *e) {
            return v;
        }
        let value = match self.provider.get(KEY_BLACKLIST_ENABLED) {
            None => self.defaults.blacklist_enabled,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    warn_invalid(KEY_BLACKLIST_ENABLED, &raw);
                    self.defaults.blacklist_enabled
                }
            },
        };
        self.cache.insert(KEY_BLACKLIST_ENABLED, Parsed::Bool(value));
        value
    }

    fn probability(&self, key: &'static str, default: f64) -> f64 {
        if let Some(Parsed::Float(v)) = self.cache.get(key).map(|e| *e) {
            return v;
        }
        let value = match self.provider.get(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => v,
                _ => {
                    warn_invalid(key, &raw);
                    default
                }
            },
        };
        self.cache.insert(key, Parsed::Float(value));
        value
    }

    fn positive_int(&self, key: &'static str, default: i64) -> i64 {
        if let Some(Parsed::Int(v)) = self.cache.get(key).map(|e| *e) {
            return v;
        }
        let value = match self.provider.get(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(v) if v > 0 => v,
                _ => {
                    warn_invalid(key, &raw);
                    default
                }
            },
        };
        self.cache.insert(key, Parsed::Int(value));
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ConfigProvider;
    use crate::infrastructure::in_memory::InMemoryConfigProvider;
    use std::sync::Arc;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GatewayConfig::from_toml(
            r#"
            [decision]
            block_threshold = 0.9

            [admission]
            buffer_size = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.decision.block_threshold, 0.9);
        assert_eq!(config.decision.hold_threshold, 0.7);
        assert_eq!(config.admission.buffer_size, 10);
        assert_eq!(config.admission.max_concurrent_requests, 30_000);
        assert_eq!(config.failover.drop_threshold, 10);
    }

    #[test]
    fn test_inverted_thresholds_fall_back_to_defaults() {
        let config = GatewayConfig::from_toml(
            r#"
            [decision]
            block_threshold = 0.5
            hold_threshold = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(config.decision.block_threshold, 0.95);
        assert_eq!(config.decision.hold_threshold, 0.7);
    }

    #[test]
    fn test_malformed_toml_is_configuration_error() {
        let result = GatewayConfig::from_toml("[decision\nblock_threshold = ");
        assert!(matches!(result, Err(GatewayError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = GatewayConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_service_reads_defaults_then_updates() {
        let provider = Arc::new(InMemoryConfigProvider::new());
        let service = ConfigService::new(provider, DecisionConfig::default());

        assert_eq!(service.block_threshold(), 0.95);
        service.update(KEY_BLOCK_THRESHOLD, "0.8");
        assert_eq!(service.block_threshold(), 0.8);
    }

    #[test]
    fn test_service_caches_until_invalidated() {
        let provider = Arc::new(InMemoryConfigProvider::new());
        let service = ConfigService::new(provider.clone(), DecisionConfig::default());

        assert_eq!(service.hold_threshold(), 0.7);
        // Changed behind the service's back: cached value still served.
        provider.set(KEY_HOLD_THRESHOLD, "0.6".to_string());
        assert_eq!(service.hold_threshold(), 0.7);

        service.invalidate();
        assert_eq!(service.hold_threshold(), 0.6);
    }

    #[test]
    fn test_service_malformed_values_fall_back() {
        let provider = Arc::new(InMemoryConfigProvider::new());
        provider.set(KEY_BLOCK_THRESHOLD, "very high".to_string());
        provider.set(KEY_AML_HIGH_VALUE, "-3".to_string());
        provider.set(KEY_BLACKLIST_ENABLED, "maybe".to_string());
        let service = ConfigService::new(provider, DecisionConfig::default());

        assert_eq!(service.block_threshold(), 0.95);
        assert_eq!(service.aml_high_value_threshold(), 1_000_000);
        assert!(service.blacklist_enabled());

        service.update(KEY_BLACKLIST_ENABLED, "false");
        assert!(!service.blacklist_enabled());
    }
}
