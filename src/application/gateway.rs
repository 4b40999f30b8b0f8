use crate::application::admission::{AdmissionController, AdmissionStats};
use crate::application::breaker::BreakerStats;
use crate::application::cleanup::{CleanupService, CleanupStats};
use crate::application::decision::{Blocklist, DecisionEngine};
use crate::application::extractor::FeatureExtractor;
use crate::application::failover::{FailoverController, FailoverStats, TransportSelector};
use crate::application::health::ProtocolHealthMonitor;
use crate::application::ingestion::TransactionIngestor;
use crate::application::pipeline::PipelineOrchestrator;
use crate::application::scoring::ScoringClient;
use crate::application::stability::NetworkStabilityMonitor;
use crate::config::{ConfigService, GatewayConfig};
use crate::domain::ports::{
    AuditSinkArc, ClockArc, ConfigProviderArc, PersistenceGatewayArc, RemoteScorerArc,
    StabilityProbeArc, VelocityStoreArc,
};
use crate::error::Result;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::in_memory::{
    InMemoryAuditSink, InMemoryConfigProvider, InMemoryPersistence, InMemoryVelocityStore,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// External collaborators the gateway is built on.
pub struct GatewayPorts {
    pub velocity: VelocityStoreArc,
    pub persistence: PersistenceGatewayArc,
    pub audit: AuditSinkArc,
    pub scorer: RemoteScorerArc,
    pub config_provider: ConfigProviderArc,
    pub clock: ClockArc,
}

impl GatewayPorts {
    /// Everything in process except the scorer.
    pub fn in_memory(scorer: RemoteScorerArc) -> Self {
        let clock: ClockArc = Arc::new(SystemClock);
        Self {
            velocity: Arc::new(InMemoryVelocityStore::new(clock.clone())),
            persistence: Arc::new(InMemoryPersistence::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            scorer,
            config_provider: Arc::new(InMemoryConfigProvider::new()),
            clock,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub admission: AdmissionStats,
    pub failover: FailoverStats,
    pub breaker: BreakerStats,
    pub cleanup: CleanupStats,
}

/// Background loops started by [`Gateway::start`]. Aborted on drop.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// The assembled gateway.
pub struct Gateway {
    pub config: GatewayConfig,
    pub settings: Arc<ConfigService>,
    pub ingestor: Arc<TransactionIngestor>,
    pub admission: Arc<AdmissionController>,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub failover: Arc<FailoverController>,
    pub stability: Arc<NetworkStabilityMonitor>,
    pub cleanup: Arc<CleanupService>,
}

impl Gateway {
    /// Wires every service on top of `ports`. Id assignment resumes after the
    /// highest transaction id the persistence gateway already holds.
    pub async fn build(config: GatewayConfig, ports: GatewayPorts) -> Result<Self> {
        let settings = Arc::new(ConfigService::new(ports.config_provider, config.decision.clone()));
        let blocklist = Arc::new(Blocklist::from_config(&config.decision));
        let decisions = Arc::new(DecisionEngine::new(
            settings.clone(),
            blocklist,
            ports.persistence.clone(),
            ports.audit,
            ports.clock.clone(),
            config.decision.ledger_max_entries,
        ));

        let selector = Arc::new(TransportSelector::default());
        let monitor = Arc::new(ProtocolHealthMonitor::new(&config.failover));
        let stability = Arc::new(NetworkStabilityMonitor::new(&config.failover));
        let scoring = ScoringClient::new(&config.scoring, ports.scorer.clone(), selector.clone(), monitor.clone());
        let failover = Arc::new(FailoverController::new(
            &config.failover,
            selector,
            monitor,
            stability.clone(),
            ports.scorer,
            ports.clock.clone(),
        ));

        let extractor = FeatureExtractor::new(ports.velocity.clone(), ports.clock.clone(), &config.pipeline);
        let pipeline = Arc::new(PipelineOrchestrator::new(
            &config.pipeline,
            extractor,
            ports.velocity.clone(),
            scoring,
            decisions,
        ));

        let cleanup = Arc::new(CleanupService::new(
            ports.velocity,
            Duration::from_secs(config.velocity.sweep_interval_secs),
        ));
        let admission = Arc::new(
            AdmissionController::new(&config.admission).with_completion_hook(cleanup.completion_hook()),
        );
        let ingestor = Arc::new(
            TransactionIngestor::new(ports.persistence, admission.clone(), pipeline.clone(), ports.clock).await?,
        );

        Ok(Self {
            config,
            settings,
            ingestor,
            admission,
            pipeline,
            failover,
            stability,
            cleanup,
        })
    }

    /// Starts the drain loop, the failover controller, the velocity sweep and,
    /// when a probe is given, the stability probe loop.
    pub fn start(&self, probe: Option<StabilityProbeArc>) -> BackgroundTasks {
        let mut handles = Vec::new();
        if let Some(drain) = self.admission.spawn_drain(self.pipeline.clone()) {
            handles.push(drain);
        }
        handles.push(self.failover.clone().spawn());
        handles.push(self.cleanup.clone().spawn());
        if let Some(probe) = probe {
            let interval = Duration::from_secs(self.config.failover.stability_probe_interval_secs.max(1));
            handles.push(self.stability.clone().spawn(probe, interval));
        }
        tracing::info!(tasks = handles.len(), "background tasks started");
        BackgroundTasks { handles }
    }

    pub async fn health(&self) -> GatewayHealth {
        GatewayHealth {
            admission: self.admission.stats(),
            failover: self.failover.stats().await,
            breaker: self.pipeline.breaker_stats(),
            cleanup: self.cleanup.stats(),
        }
    }
}
