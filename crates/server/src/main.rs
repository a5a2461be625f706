use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strom_core::{config, ConfigService, ConfigSnapshot, RuntimeConfig};
use strom_server::{build_router, AppState, TaskControl, TaskManager};

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = RuntimeConfig::from_env();
    cfg.log_summary();

    let manager = TaskManager::new(cfg.edge_capacity);
    let loaded = manager.load_dir(&cfg.task_dir).await?;
    tracing::info!(count = loaded, dir = %cfg.task_dir.display(), "task definitions loaded");
    for summary in manager.list().await {
        if let Err(e) = manager.enable(&summary.id).await {
            tracing::warn!(task = %summary.id, error = %e, "task failed to enable");
        }
    }

    let state = Arc::new(AppState {
        write: Arc::new(manager.clone()),
        tasks: Arc::new(manager),
        config: Arc::new(ConfigService::new(ConfigSnapshot::default())),
        auth: None,
    });
    let app = build_router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "stromd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
