use std::sync::Arc;

use anyhow::{Context, Result};
use bpmflow_engine::{
    AsyncExecutorConfig, EngineConfig, InMemoryStore, PostgresStore, ProcessEngine, RuntimeStore,
};
use bpmflow_worker::{deploy_directory, WorkerConfig};
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bpmflow_worker=info,bpmflow_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("bpmflow-worker starting...");
    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }
    let config = WorkerConfig::from_env();

    let store: Arc<dyn RuntimeStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let store = PostgresStore::new(pool);
            if config.run_migrations {
                store.migrate().await.context("Failed to run migrations")?;
            }
            tracing::info!("Using PostgreSQL store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let engine = ProcessEngine::new(EngineConfig::builder(store).apply_env().build());
    if let Some(dir) = &config.definitions_dir {
        let deployed = deploy_directory(&engine, dir)?;
        tracing::info!(deployed, dir = %dir.display(), "Deployed process definitions");
    }

    let executor = engine.async_executor(AsyncExecutorConfig::from_env());
    tracing::info!(
        lock_owner = %executor.lock_owner(),
        max_concurrency = executor.config().max_concurrency,
        "Starting async executor"
    );
    executor.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = executor.shutdown().await {
        tracing::error!(error = %e, "Async executor shutdown failed");
        return Err(e.into());
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
