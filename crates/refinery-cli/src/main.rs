mod db;
mod pipeline;
mod sign;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use refinery_core::{AppConfig, RefineryStore, StoreBackend};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "refinery-cli")]
#[command(about = "Refinery pipeline operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: db::DbCommands,
    },
    /// Run the pipeline or inspect past runs
    Pipeline {
        #[command(subcommand)]
        command: pipeline::PipelineCommands,
    },
    /// Expire stale cards and prune the nonce ledger
    Cleanup,
    /// Print the ingest headers for a capture file
    Sign {
        /// Path to the capture JSON, signed byte for byte
        file: PathBuf,

        /// Nonce to sign with; a random UUID when omitted
        #[arg(long)]
        nonce: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("refinery-cli: no command given; run with --help for usage");
        return Ok(());
    };

    let config = refinery_core::load_app_config()?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match command {
        Commands::Db { command } => db::run(&config, command).await,
        Commands::Pipeline { command } => {
            let store = open_store(&config).await?;
            pipeline::run(store.as_ref(), &config, command).await
        }
        Commands::Cleanup => {
            let store = open_store(&config).await?;
            pipeline::run_cleanup_once(store.as_ref()).await
        }
        Commands::Sign { file, nonce } => sign::run(&config, &file, nonce),
    }
}

/// Opens the configured store. Postgres connections do not run migrations;
/// use `db migrate` for that.
async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RefineryStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let pool = refinery_db::connect_pool_from_config(config).await?;
            let store: Arc<dyn RefineryStore> = Arc::new(refinery_db::PgStore::new(pool));
            Ok(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; nothing persists past this command");
            let store: Arc<dyn RefineryStore> = Arc::new(refinery_db::MemoryStore::new());
            Ok(store)
        }
    }
}
