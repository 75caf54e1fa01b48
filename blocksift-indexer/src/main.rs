//! blocksift indexer CLI
//!
//! Entry point for the indexer binary. Provides subcommands for:
//! - `run` - Start the indexer
//! - `version` - Show version information
//!
//! The user-handler sandbox and the relational store are external
//! collaborators; this binary wires the in-memory metadata store and a
//! logging block consumer, which is enough to drive the core end-to-end
//! against a live chain.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chain_api::types::FetchedBlock;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use blocksift_indexer::config::Settings;
use blocksift_indexer::error::Result;
use blocksift_indexer::indexer::IndexerService;
use blocksift_indexer::ports::{BlockConsumer, ProcessOutcome};
use blocksift_indexer::store::MemoryMetadataStore;
use blocksift_indexer::types::DataSource;

/// blocksift block indexer
#[derive(Parser, Debug)]
#[command(name = "blocksift-indexer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Environment name (selects config/{environment}.toml)
    #[arg(short, long, default_value = "default")]
    environment: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the indexer
    Run {
        /// JSON file with the data-source definitions
        #[arg(long)]
        data_sources: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

/// Default consumer: acknowledges each block with a log line.
///
/// Real deployments replace this with the handler-sandbox adapter.
#[derive(Debug)]
struct LoggingConsumer;

#[async_trait]
impl BlockConsumer for LoggingConsumer {
    async fn process_block(
        &self,
        block: &FetchedBlock,
        data_sources: &[DataSource],
    ) -> Result<ProcessOutcome> {
        info!(
            height = block.height(),
            transactions = block.transactions.len(),
            logs = block.logs.len(),
            active_sources = data_sources.len(),
            "processed block"
        );
        Ok(ProcessOutcome {
            parent_hash: block.parent_hash(),
            dynamic_data_sources: vec![],
        })
    }
}

/// Initialize the subscriber.
///
/// With `logging.file_path` set, output goes to a daily-rolling file through
/// a non-blocking writer; the returned guard must live as long as the
/// process or buffered lines are lost on exit.
fn init_tracing(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.logging.level.clone()));
    let json = settings.logging.format == "json";

    match &settings.logging.file_path {
        Some(path) => {
            let path = std::path::Path::new(path);
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let prefix = path
                .file_name()
                .map_or_else(|| "blocksift.log".into(), |name| name.to_string_lossy());

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, &*prefix));

            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

fn init_metrics(settings: &Settings) -> eyre::Result<()> {
    if !settings.metrics.enabled {
        return Ok(());
    }
    let address: SocketAddr =
        format!("{}:{}", settings.metrics.host, settings.metrics.port).parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    info!(%address, "metrics exporter listening");
    Ok(())
}

fn load_data_sources(path: Option<&PathBuf>) -> eyre::Result<Vec<DataSource>> {
    let Some(path) = path else {
        warn!("no data sources supplied, every block runs zero handlers");
        return Ok(vec![]);
    };
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // .env files are a convenience, not a requirement.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { data_sources } => {
            let settings = Settings::load(&cli.environment)?;
            settings.validate()?;

            // Keeps the non-blocking file writer flushing until exit.
            let _log_guard = init_tracing(&settings);
            init_metrics(&settings)?;

            if settings.network.dictionary_resolver.is_some() {
                warn!("dictionary_resolver is handled by the deployment layer and ignored here");
            }

            info!(
                version = blocksift_indexer::VERSION,
                endpoints = settings.network.endpoints.len(),
                "starting blocksift indexer"
            );

            let sources = load_data_sources(data_sources.as_ref())?;
            let store = Arc::new(MemoryMetadataStore::new());
            let token = CancellationToken::new();

            // Ctrl-C triggers a graceful drain: the fetcher stops issuing
            // work and in-flight commits finish.
            {
                let token = token.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown signal received");
                        token.cancel();
                    }
                });
            }

            let service = IndexerService::start(
                &settings,
                sources,
                Arc::new(LoggingConsumer),
                store,
                token,
            )
            .await?;

            service.wait().await?;
            info!("indexer stopped");
        }
        Commands::Version => {
            println!("blocksift-indexer {}", blocksift_indexer::VERSION);
        }
    }

    Ok(())
}
