use anyhow::Result;
use clap::Parser;
use coalescer::config::Config;
use coalescer::dispatcher::LogDispatcher;
use coalescer::handlers::AppState;
use coalescer::pipeline::{Pipeline, PipelineConfig};
use coalescer::server::Server;
use coalescer::state_store::{FileStore, StateStore};
use coalescer::validation::KeyValidator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "coalescer", about = "Request aggregation and rate governance service")]
struct Args {
    /// Bind address, overriding BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Pipeline configuration file, overriding PIPELINE_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    /// Journal file for crash recovery, overriding STORAGE_PATH
    #[arg(long)]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("coalescer={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind_addr = args.bind.unwrap_or(config.bind_addr);
    let pipeline_config_path = args
        .config
        .or_else(|| config.pipeline_config.as_ref().map(PathBuf::from));
    let storage_path = args
        .storage
        .or_else(|| config.storage_path.as_ref().map(PathBuf::from));

    let pipeline_config = match &pipeline_config_path {
        Some(path) => PipelineConfig::load(path).await?,
        None => PipelineConfig::default(),
    };

    let store = storage_path.map(|path| {
        tracing::info!("Journaling pending entries to {}", path.display());
        Arc::new(FileStore::new(path)) as Arc<dyn StateStore>
    });

    tracing::info!("Starting coalescer service");
    tracing::info!(
        "Configuration: bind_addr={}, debounce_enabled={}",
        bind_addr,
        pipeline_config.debounce.enabled
    );

    let pipeline = Pipeline::new(pipeline_config, Arc::new(LogDispatcher), store)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start pipeline: {}", e))?;

    let state = Arc::new(AppState {
        pipeline,
        validator: KeyValidator::new(),
        per_client_keys: config.per_client_keys,
    });

    Server::new(state, bind_addr)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
