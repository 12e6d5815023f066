use std::sync::Arc;
use anyhow::Context;
use tracing::{error, info};
use ingest_infra::api::{ApiState, create_router};
use ingest_infra::config::AppConfig;
use ingest_infra::engine::IngestionEngine;
use ingest_infra::observability::metrics::register_metrics;
use ingest_infra::observability::tracing::init_tracing;
use ingest_infra::workers::ProviderRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let json_logs = std::env::var("INGEST_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    init_tracing("info", json_logs);
    register_metrics();

    let env = std::env::var("INGEST_ENV").unwrap_or_else(|_| "default".to_string());
    let app = AppConfig::load(&env).context("loading configuration")?;
    let enabled: Vec<String> = app.enabled_sources().map(|s| s.name.clone()).collect();
    info!(env = %env, sources = app.sources.len(), enabled = ?enabled, "Configuration loaded");

    let registry = ProviderRegistry::new().with_http_json(enabled);
    let metrics_addr = app.engine.metrics_addr.clone();
    let engine = Arc::new(IngestionEngine::new(app.engine, app.sources, registry));
    engine.start().await.context("starting ingestion engine")?;

    let server = match metrics_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding observability server to {}", addr))?;
            info!("Observability server listening on {}", addr);
            let router = create_router(Arc::new(ApiState { engine: Arc::clone(&engine) }));
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    error!("Observability server failed: {}", e);
                }
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    if let Some(server) = server {
        server.abort();
    }
    engine.stop().await.context("stopping ingestion engine")?;

    let metrics = engine.get_metrics();
    info!(
        total_requests = metrics.engine.total_requests,
        success_rate = metrics.engine.success_rate,
        undelivered = engine.get_buffer_items(usize::MAX).len(),
        "Ingestion engine shut down"
    );
    Ok(())
}
