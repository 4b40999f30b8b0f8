use clap::{Args, Parser, Subcommand};
use fraudgate::application::gateway::{Gateway, GatewayPorts};
use fraudgate::config::GatewayConfig;
use fraudgate::domain::ports::{PersistenceGatewayArc, StabilityProbeArc};
use fraudgate::infrastructure::audit::TracingAuditSink;
use fraudgate::infrastructure::http_scorer::{HttpRemoteScorer, HttpStabilityProbe};
use fraudgate::interfaces::csv::decision_writer::DecisionWriter;
use fraudgate::interfaces::csv::transaction_reader::TransactionReader;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[command(flatten)]
        common: CommonArgs,

        /// Address to listen on (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Score transactions from a CSV file and print decisions as CSV
    Replay {
        /// Input transactions CSV file
        input: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fraudgate=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_persistence(db_path: Option<&Path>) -> Result<Option<PersistenceGatewayArc>> {
    use fraudgate::infrastructure::rocksdb::RocksDBPersistence;

    match db_path {
        Some(path) => {
            let store = RocksDBPersistence::open(path).into_diagnostic()?;
            tracing::info!(path = %path.display(), "using RocksDB persistence");
            Ok(Some(Arc::new(store)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_persistence(db_path: Option<&Path>) -> Result<Option<PersistenceGatewayArc>> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(None)
}

async fn build_gateway(config: GatewayConfig, common: &CommonArgs) -> Result<Gateway> {
    let scorer = Arc::new(HttpRemoteScorer::new(&config.scoring).into_diagnostic()?);
    let mut ports = GatewayPorts::in_memory(scorer);
    ports.audit = Arc::new(TracingAuditSink);
    if let Some(persistence) = open_persistence(common.db_path.as_deref())? {
        ports.persistence = persistence;
    }
    Gateway::build(config, ports).await.into_diagnostic()
}

fn stability_probe(config: &GatewayConfig) -> Result<StabilityProbeArc> {
    let url = config
        .failover
        .stability_probe_url
        .clone()
        .unwrap_or_else(|| format!("{}/health", config.scoring.url.trim_end_matches('/')));
    let timeout = config.scoring.connect_timeout() + config.scoring.request_timeout();
    Ok(Arc::new(HttpStabilityProbe::new(url, timeout).into_diagnostic()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Serve { common, bind } => {
            let mut config = GatewayConfig::load(common.config.as_deref());
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let addr = config.server.bind;
            let probe = stability_probe(&config)?;
            let gateway = Arc::new(build_gateway(config, &common).await?);
            let tasks = gateway.start(Some(probe));

            fraudgate::interfaces::http::serve(gateway, addr)
                .await
                .into_diagnostic()?;
            tasks.shutdown();
        }
        Command::Replay { input, common } => {
            let config = GatewayConfig::load(common.config.as_deref());
            let gateway = build_gateway(config, &common).await?;
            let tasks = gateway.start(None);

            let file = File::open(input).into_diagnostic()?;
            let reader = TransactionReader::new(file);
            let stdout = io::stdout();
            let mut writer = DecisionWriter::new(stdout.lock());

            for request in reader.requests() {
                match request {
                    Ok(request) => match gateway.ingestor.ingest(request).await {
                        Ok(outcome) => writer.write(&outcome).into_diagnostic()?,
                        Err(e) => eprintln!("Error processing transaction: {}", e),
                    },
                    Err(e) => eprintln!("Error reading transaction: {}", e),
                }
            }

            // Let the drain loop finish anything that overflowed.
            while !gateway.admission.is_idle() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            writer.flush().into_diagnostic()?;
            tasks.shutdown();
        }
    }

    Ok(())
}
