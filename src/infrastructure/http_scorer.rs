use crate::config::ScoringConfig;
use crate::domain::ports::{RemoteScorer, StabilityProbe};
use crate::domain::scoring::{ScoreRequest, ScoreResponse, ScoringFailure, Transport};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::time::Duration;

fn classify(err: reqwest::Error) -> ScoringFailure {
    if err.is_timeout() {
        ScoringFailure::Timeout
    } else if err.is_decode() {
        ScoringFailure::Decode(err.to_string())
    } else if let Some(status) = err.status() {
        ScoringFailure::Status(status.as_u16())
    } else {
        ScoringFailure::Connection(err.to_string())
    }
}

/// Remote scorer reached over HTTP.
///
/// Two clients are kept warm: one speaking HTTP/2 with prior knowledge and one
/// pinned to HTTP/1.1. The caller picks which one to use per request.
#[derive(Clone)]
pub struct HttpRemoteScorer {
    base_url: String,
    http2: reqwest::Client,
    http1: reqwest::Client,
}

impl HttpRemoteScorer {
    pub fn new(config: &ScoringConfig) -> Result<Self> {
        let build = |prefer_http2: bool| {
            let builder = reqwest::Client::builder()
                .no_proxy()
                .connect_timeout(config.connect_timeout())
                .timeout(config.request_timeout());
            let builder = if prefer_http2 {
                builder.http2_prior_knowledge()
            } else {
                builder.http1_only().pool_max_idle_per_host(256)
            };
            builder
                .build()
                .map_err(|e| GatewayError::ConfigurationInvalid(format!("HTTP client: {e}")))
        };

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http2: build(true)?,
            http1: build(false)?,
        })
    }

    fn client(&self, transport: Transport) -> &reqwest::Client {
        match transport {
            Transport::Http2 => &self.http2,
            Transport::Http1 => &self.http1,
        }
    }
}

#[async_trait]
impl RemoteScorer for HttpRemoteScorer {
    async fn score(
        &self,
        transport: Transport,
        request: &ScoreRequest<'_>,
    ) -> std::result::Result<ScoreResponse, ScoringFailure> {
        let url = format!("{}/score", self.base_url);
        let response = self
            .client(transport)
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            return Err(ScoringFailure::Status(response.status().as_u16()));
        }
        response
            .json::<ScoreResponse>()
            .await
            .map_err(|e| ScoringFailure::Decode(e.to_string()))
    }

    async fn ping(&self, transport: Transport) -> std::result::Result<(), ScoringFailure> {
        let url = format!("{}/health", self.base_url);
        let response = self.client(transport).get(&url).send().await.map_err(classify)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ScoringFailure::Status(response.status().as_u16()))
        }
    }
}

/// Samples network stability with a plain HTTP GET.
pub struct HttpStabilityProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpStabilityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::ConfigurationInvalid(format!("HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl StabilityProbe for HttpStabilityProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "stability probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_scorer_is_a_drop() {
        let config = ScoringConfig {
            // Port 9 (discard) is closed on test machines.
            url: "http://127.0.0.1:9/".to_string(),
            connect_timeout_ms: 200,
            request_timeout_ms: 500,
            ..ScoringConfig::default()
        };
        let scorer = HttpRemoteScorer::new(&config).unwrap();
        assert_eq!(scorer.base_url, "http://127.0.0.1:9");

        let err = scorer.ping(Transport::Http1).await.unwrap_err();
        assert!(err.is_drop(), "{err:?}");
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable_as_unstable() {
        let probe = HttpStabilityProbe::new("http://127.0.0.1:9/health", Duration::from_millis(300)).unwrap();
        assert!(!probe.probe().await);
    }
}
