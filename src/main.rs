use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::Semaphore;

use beansack::collector::{run_collection, Collector};
use beansack::config::{Config, InstanceMode};
use beansack::embedding::remote::{HttpEmbeddingProvider, WireFormat};
use beansack::embedding::Embedder;
use beansack::extraction::openai::OpenAIChatModel;
use beansack::extraction::Extractor;
use beansack::logging;
use beansack::sack::BeanSack;
use beansack::schedule::{spawn_job, Cron};
use beansack::server::{self, AppState};
use beansack::store::memory::MemoryBackend;
use beansack::store::postgres::PgBackend;
use beansack::store::Backend;
use beansack::tokens::TokenCounter;

#[derive(Parser)]
#[command(name = "beansack", version, about = "News and social media enrichment and retrieval service")]
struct Cli {
    /// TOML configuration file; environment variables take precedence
    #[arg(long, default_value = "beansack.toml")]
    config: String,

    /// Skip automatic database migration on startup
    #[arg(long)]
    skip_migrate: bool,
}

/// Pick the storage backend from the DSN scheme.
async fn create_backend(dsn: &str, run_migrations: bool) -> Result<Arc<dyn Backend>> {
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        let backend = PgBackend::new(dsn, run_migrations).await?;
        Ok(Arc::new(backend))
    } else if dsn.starts_with("memory://") {
        tracing::warn!("Using the in-memory backend; nothing will be persisted");
        Ok(Arc::new(MemoryBackend::new()))
    } else {
        anyhow::bail!("Unsupported DB_CONNECTION_STRING scheme: expected postgres:// or memory://")
    }
}

async fn create_sack(config: &Config, run_migrations: bool) -> Result<Arc<BeanSack>> {
    let backend = create_backend(&config.db_connection_string, run_migrations).await?;
    tracing::info!("Storage backend initialized");

    let tokens = TokenCounter::load(&config.tokenizer).context("Failed to load tokenizer")?;

    let format: WireFormat = config.embedder_api.parse()?;
    let provider = HttpEmbeddingProvider::new(config.embedder_url.clone(), format)?;
    let embedder = Embedder::new(Arc::new(provider), tokens.clone(), config.embedder_ctx);

    let model = OpenAIChatModel::new(
        &config.llmservice_base_url,
        config.llmservice_api_key.clone().unwrap_or_default(),
        config.llmservice_model.clone(),
    )?;
    let extractor = Extractor::new(Arc::new(model), tokens.clone());

    let sack = BeanSack::new(backend, embedder, extractor, tokens, config.background_tasks)?;
    Ok(Arc::new(sack))
}

/// Register the collect-then-rectify and cleanup jobs behind one shared gate.
fn schedule_jobs(config: &Config, sack: &Arc<BeanSack>, collectors: Vec<Arc<dyn Collector>>) -> Result<()> {
    let collection: Cron = config.collection_schedule.parse()?;
    let cleanup: Cron = config.cleanup_schedule.parse()?;
    let gate = Arc::new(Semaphore::new(1));
    let collectors = Arc::new(collectors);

    let collect_sack = Arc::clone(sack);
    spawn_job("collect", collection, Arc::clone(&gate), move || {
        let sack = Arc::clone(&collect_sack);
        let collectors = Arc::clone(&collectors);
        async move {
            run_collection(&sack, &collectors).await;
        }
    });

    let cleanup_sack = Arc::clone(sack);
    let window = config.cleanup_window;
    spawn_job("cleanup", cleanup, gate, move || {
        let sack = Arc::clone(&cleanup_sack);
        async move {
            sack.cleanup(window).await;
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration; a bad configuration is fatal
    let config = match Config::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    // 3. Initialize logging before anything else logs
    logging::init_logging(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.instance_mode,
        "beansack starting"
    );

    // 4. Build the sack: storage, tokenizer, embedder, extractor
    let sack = create_sack(&config, !cli.skip_migrate).await?;

    // 5. Mode-specific work
    let mode = config.instance_mode;
    if mode == InstanceMode::Debug {
        let report = sack.rectify().await;
        tracing::info!(?report, "Startup rectification finished");
    }
    if mode.runs_indexer() {
        // Concrete collectors are registered here by deployments that ship them
        let collectors: Vec<Arc<dyn Collector>> = Vec::new();
        schedule_jobs(&config, &sack, collectors)?;
        if config.internal_auth_token.is_none() {
            tracing::warn!("INTERNAL_AUTH_TOKEN is not set; ingest routes are disabled");
        }
    }

    // 6. Serve until Ctrl-C
    let state = AppState::new(Arc::clone(&sack), config.internal_auth_token.clone());
    let app = server::router(state, mode);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // 7. Let detached enrichment finish before exiting
    sack.flush().await;
    tracing::info!("beansack stopped");
    Ok(())
}
