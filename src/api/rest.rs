use axum::{
    Router,
    routing::get,
    extract::{Json, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;
use crate::engine::{IngestionEngine, MetricsSnapshot};
use crate::error::Error;
use crate::observability::metrics::gather_text;

pub struct ApiState {
    pub engine: Arc<IngestionEngine>,
}

/// Read-only observability surface.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    open_circuits: usize,
}

async fn health_check(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.engine.get_metrics();
    let open_circuits = snapshot
        .pool
        .as_ref()
        .map(|pool| {
            pool.workers
                .iter()
                .filter(|w| w.circuit_state != crate::resilience::CircuitState::Healthy)
                .count()
        })
        .unwrap_or(0);

    let (code, status) = match state.engine.check_health().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(Error::EngineNotRunning) => (StatusCode::SERVICE_UNAVAILABLE, "STOPPED"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED"),
    };

    (code, Json(HealthResponse { status, running: snapshot.running, open_circuits }))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_text(),
    )
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<MetricsSnapshot> {
    Json(state.engine.get_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use crate::config::EngineConfig;
    use crate::observability::metrics::register_metrics;
    use crate::workers::ProviderRegistry;

    async fn serve(engine: Arc<IngestionEngine>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(Arc::new(ApiState { engine }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_endpoints_follow_engine_state() {
        register_metrics();
        let engine = Arc::new(IngestionEngine::new(EngineConfig::default(), vec![], ProviderRegistry::new()));
        let base = serve(Arc::clone(&engine)).await;
        let client = reqwest::Client::new();

        let stopped = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(stopped.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        engine.start().await.unwrap();
        let health: Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "OK");
        assert_eq!(health["open_circuits"], 0);

        let status: Value = client.get(format!("{}/status", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["running"], true);
        assert_eq!(status["sla"]["p95_met"], true);

        let metrics = client.get(format!("{}/metrics", base)).send().await.unwrap().text().await.unwrap();
        assert!(metrics.contains("ingest_buffer_depth"));

        engine.stop().await.unwrap();
    }
}
