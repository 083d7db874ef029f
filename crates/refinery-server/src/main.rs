mod api;
mod middleware;
mod scheduler;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use refinery_core::{RefineryStore, StoreBackend};
use refinery_db::{MemoryStore, PgStore};
use refinery_pipeline::{IngestVerifier, PipelineConfig};
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use crate::api::{build_app, default_rate_limit_state, AppState};
use crate::middleware::{PipelineAuth, ReadAuth};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(refinery_core::load_app_config()?);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(env = %config.env, store = %config.store_backend, "starting refinery-server");

    let (store, pool) = open_store(&config).await?;

    let extractor = refinery_pipeline::anthropic_client(&config)
        .context("failed to build the model client")?;

    let verifier = match config.ingest_hmac_secret.as_deref() {
        Some(secret) => Some(IngestVerifier::new(secret)?),
        None => {
            tracing::warn!("REFINERY_INGEST_HMAC_SECRET not set; ingest will answer 503");
            None
        }
    };

    let state = AppState {
        store,
        extractor: Arc::new(extractor),
        pipeline: Arc::new(PipelineConfig::from_app_config(&config)),
        verifier,
        pool,
    };

    // Keep the scheduler handle alive for the lifetime of the server.
    let _scheduler = if config.scheduler_enabled {
        Some(
            scheduler::build_scheduler(state.clone(), &config)
                .await
                .context("failed to start the job scheduler")?,
        )
    } else {
        tracing::info!("scheduler disabled; runs only start on request");
        None
    };

    let pipeline_auth = PipelineAuth::from_config(&config);
    let read_auth = ReadAuth::from_config(&config)?;
    let app = build_app(state, pipeline_auth, read_auth, default_rate_limit_state());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn open_store(
    config: &refinery_core::AppConfig,
) -> anyhow::Result<(Arc<dyn RefineryStore>, Option<PgPool>)> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let pool = refinery_db::connect_pool_from_config(config).await?;
            let applied = refinery_db::run_migrations(&pool).await?;
            tracing::info!(applied, "database migrations complete");
            let store: Arc<dyn RefineryStore> = Arc::new(PgStore::new(pool.clone()));
            Ok((store, Some(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; state is lost on restart");
            let store: Arc<dyn RefineryStore> = Arc::new(MemoryStore::new());
            Ok((store, None))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, starting graceful shutdown");
}
