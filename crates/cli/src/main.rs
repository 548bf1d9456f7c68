//! Insights CLI entry point.
//!
//! This binary is the composition root. It:
//!
//! 1. loads and validates [`config::AppConfig`];
//! 2. installs the tracing subscriber (see [`telemetry`]);
//! 3. builds the concrete store, provider, limiters and orchestrator and
//!    injects them into the HTTP surface.
//!
//! Commands: `serve` runs intake, query and batch processing in one process;
//! `ingest` submits records to a running server; `insights` prints a page of
//! results straight from the SQLite database.

mod config;
mod ingest;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{AppConfig, StoreBackend};
use listener::{AppState, InsightParams, InsightsResponse};
use pipeline::{AdmissionLimiter, InsightReader, WorkStore};
use processor::{AnalysisClient, BatchOrchestrator, EgressLimiter};
use store::{MemoryStore, SqliteStore};
use telemetry::{LogFormat, Telemetry};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "insights",
    version,
    about = "Conversation sentiment pipeline: intake, batched analysis and insight queries"
)]
struct Cli {
    /// TOML configuration file. Defaults to ./insights.toml when present.
    #[arg(long, env = "INSIGHTS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        env = "INSIGHTS_LOG_FORMAT",
        default_value_t = LogFormat::Pretty,
        global = true
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP surface and the batch orchestrator until Ctrl-C.
    Serve {
        /// Overrides `server.bind`.
        #[arg(long, env = "INSIGHTS_BIND")]
        bind: Option<String>,

        /// Overrides `store.path`.
        #[arg(long, env = "INSIGHTS_DB")]
        db: Option<PathBuf>,

        /// Keep everything in memory, overriding `store.backend`.
        #[arg(long)]
        memory: bool,
    },

    /// Submit JSON Lines records (or the sample set) to a running server.
    Ingest(ingest::IngestArgs),

    /// Print a page of insights as JSON.
    Insights {
        /// Overrides `store.path`.
        #[arg(long, env = "INSIGHTS_DB")]
        db: Option<PathBuf>,

        /// Inclusive lower bound, ISO 8601.
        #[arg(long)]
        start: String,

        /// Inclusive upper bound, ISO 8601.
        #[arg(long)]
        end: String,

        /// `positive`, `negative` or `neutral`.
        #[arg(long)]
        sentiment: Option<String>,

        #[arg(long)]
        min_confidence: Option<String>,

        #[arg(long)]
        limit: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(cli.log_format)?;

    let outcome = run(cli).await;
    if let Err(err) = &outcome {
        tracing::error!(error = ?err, "command failed");
    }
    telemetry.shutdown();
    outcome
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Serve { bind, db, memory } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(db) = db {
                config.store.path = db;
            }
            if memory {
                config.store.backend = StoreBackend::Memory;
            }
            config.validate().context("validating overrides")?;
            serve(config).await
        }
        Command::Ingest(args) => {
            let summary = ingest::run(args).await?;
            println!(
                "accepted {}, rejected {}, failed {}",
                summary.accepted, summary.rejected, summary.failed
            );
            Ok(())
        }
        Command::Insights {
            db,
            start,
            end,
            sentiment,
            min_confidence,
            limit,
        } => {
            let path = db.unwrap_or(config.store.path);
            let params = InsightParams {
                start_time: Some(start),
                end_time: Some(end),
                limit,
                min_confidence,
                sentiment,
            };
            print_insights(&path, params).await
        }
    }
}

type Stores = (Arc<dyn WorkStore>, Arc<dyn InsightReader>);

fn open_store(config: &AppConfig) -> Result<Stores> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("using in-memory store; nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        StoreBackend::Sqlite => {
            let path = &config.store.path;
            let store = Arc::new(
                SqliteStore::open(path)
                    .with_context(|| format!("opening database {}", path.display()))?,
            );
            info!(path = %path.display(), "opened SQLite store");
            Ok((store.clone(), store))
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let (work, insights) = open_store(&config)?;

    let api_key = config::api_key_from_env()?;
    let provider = llm::ChatCompletionsProvider::new(config.provider(api_key))
        .context("building analysis provider")?;
    let egress = Arc::new(EgressLimiter::new(config.egress())?);
    let client = AnalysisClient::new(Arc::new(provider), egress, config.analysis())?;
    let orchestrator = BatchOrchestrator::new(Arc::clone(&work), Arc::new(client), config.batch())?;

    let admission = Arc::new(AdmissionLimiter::new(config.admission())?);
    let app = listener::router(AppState::new(work, insights, admission));

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    orchestrator.start();
    info!(%addr, "listening");
    let served = axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown");

    info!("stopping batch orchestrator");
    orchestrator.stop().await;
    served
}

/// Resolves on Ctrl-C. If the handler cannot be installed the server keeps
/// running and must be stopped externally.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl-C; only an external kill will stop the server");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn print_insights(path: &std::path::Path, params: InsightParams) -> Result<()> {
    let query = params.into_query()?;
    let store = SqliteStore::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    let page = store.query_insights(&query).await?;
    let response = InsightsResponse::new(&query, page);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
