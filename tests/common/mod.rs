#![allow(dead_code)]

use async_trait::async_trait;
use fraudgate::application::gateway::{Gateway, GatewayPorts};
use fraudgate::config::GatewayConfig;
use fraudgate::domain::ports::RemoteScorer;
use fraudgate::domain::scoring::{ScoreRequest, ScoreResponse, ScoringFailure, Transport};
use fraudgate::domain::transaction::TransactionRequest;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Error, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Scores by merchant, falling back to a default score.
pub struct StubScorer {
    default_score: f64,
    by_merchant: HashMap<String, f64>,
    delay: Duration,
    down: AtomicBool,
    calls: AtomicU32,
    active: AtomicU32,
    peak: AtomicU32,
}

impl StubScorer {
    pub fn fixed(score: f64) -> Self {
        Self {
            default_score: score,
            by_merchant: HashMap::new(),
            delay: Duration::ZERO,
            down: AtomicBool::new(false),
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }

    pub fn with_merchant(mut self, merchant_id: &str, score: f64) -> Self {
        self.by_merchant.insert(merchant_id.to_string(), score);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most score calls ever running at the same time.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteScorer for StubScorer {
    async fn score(
        &self,
        _: Transport,
        request: &ScoreRequest<'_>,
    ) -> Result<ScoreResponse, ScoringFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ScoringFailure::Connection("connection refused".to_string()));
        }
        let score = request
            .features
            .get_text("merchant_id")
            .and_then(|merchant| self.by_merchant.get(merchant))
            .copied()
            .unwrap_or(self.default_score);
        Ok(ScoreResponse {
            score,
            latency_ms: Some(1),
            risk_details: BTreeMap::new(),
        })
    }

    async fn ping(&self, _: Transport) -> Result<(), ScoringFailure> {
        if self.down.load(Ordering::SeqCst) {
            Err(ScoringFailure::Connection("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Config tuned for tests: no retry backoff and no global rate limit.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.scoring.retry_max = 1;
    config.scoring.retry_backoff_ms = 0;
    config.admission.rate_limit_per_second = 0;
    config.admission.drain_interval_ms = 10;
    config
}

pub async fn build_gateway(config: GatewayConfig, scorer: Arc<StubScorer>) -> Gateway {
    Gateway::build(config, GatewayPorts::in_memory(scorer))
        .await
        .expect("gateway should build")
}

pub fn request(merchant_id: &str, pan: &str, amount_minor_units: i64) -> TransactionRequest {
    TransactionRequest {
        txn_id: None,
        merchant_id: merchant_id.to_string(),
        terminal_id: Some("term-1".to_string()),
        amount_minor_units,
        currency: "USD".to_string(),
        card_pan: pan.to_string(),
        emv_tags: BTreeMap::new(),
        acquirer_response: None,
        timestamp: None,
    }
}

pub const CSV_HEADER: [&str; 8] = [
    "txn_id",
    "merchant_id",
    "terminal_id",
    "amount_minor_units",
    "currency",
    "card_pan",
    "emv_tags",
    "timestamp",
];

/// Writes `rows` small contactless transactions from one card.
pub fn generate_csv(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(CSV_HEADER)?;

    for i in 1..=rows {
        wtr.write_record([
            i.to_string().as_str(),
            "m-coffee",
            "t-1",
            "450",
            "USD",
            "4111111111111111",
            "9F34=1F0302",
            "",
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// A scorer endpoint nothing listens on, with fast failure and no retries.
pub fn write_offline_config(path: &Path, extra: &str) -> Result<(), Error> {
    let mut file = File::create(path)?;
    writeln!(
        file,
        r#"
[scoring]
url = "http://127.0.0.1:9"
connect_timeout_ms = 200
request_timeout_ms = 200
retry_max = 1
retry_backoff_ms = 0

[admission]
rate_limit_per_second = 0
drain_interval_ms = 10
"#
    )?;
    writeln!(file, "{}", extra)?;
    Ok(())
}
