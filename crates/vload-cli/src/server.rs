//! HTTP service: event intake, health and metrics endpoints.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use vload_core::health::{ComponentStatus, HealthCheck, HealthStatus};
use vload_core::metrics::LoaderMetrics;
use vload_core::Pipeline;

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<LoaderMetrics>,
}

impl ServerState {
    pub fn new(pipeline: Pipeline) -> Self {
        let health = Arc::clone(pipeline.health());
        let metrics = Arc::clone(pipeline.metrics());
        Self {
            pipeline: Arc::new(pipeline),
            health,
            metrics,
        }
    }
}

/// Health response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentStatusResponse>,
}

/// Component status response.
#[derive(Debug, Serialize)]
pub struct ComponentStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentStatusResponse {
    fn from(status: &ComponentStatus) -> Self {
        let (status, message) = match status {
            ComponentStatus::Healthy => ("healthy", None),
            ComponentStatus::Degraded(msg) => ("degraded", Some(msg.clone())),
            ComponentStatus::Unhealthy(msg) => ("unhealthy", Some(msg.clone())),
            ComponentStatus::Unknown => ("unknown", None),
        };
        ComponentStatusResponse {
            status: status.to_string(),
            message,
        }
    }
}

/// Error body returned by `POST /events`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Router serving event intake and health probes.
pub fn events_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/events", post(events_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Router serving Prometheus metrics.
pub fn metrics_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Start the event and metrics servers and run them until shutdown.
pub async fn start_server(
    state: Arc<ServerState>,
    listen_port: u16,
    metrics_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind event server on port {listen_port}: {e}"))?;
    info!(port = listen_port, "Event server started");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .map_err(|e| {
            anyhow::anyhow!("Failed to bind metrics server on port {metrics_port}: {e}")
        })?;
    info!(port = metrics_port, "Metrics server started");

    let event_server = async {
        axum::serve(listener, events_router(Arc::clone(&state)))
            .await
            .map_err(|e| error!(error = %e, "Event server error"))
    };

    let metrics_server = async {
        axum::serve(metrics_listener, metrics_router(Arc::clone(&state)))
            .await
            .map_err(|e| error!(error = %e, "Metrics server error"))
    };

    tokio::select! {
        _ = event_server => {}
        _ = metrics_server => {}
        _ = shutdown_rx.recv() => {
            info!("HTTP servers shutting down");
        }
    }
    Ok(())
}

/// One event delivery per request.
async fn events_handler(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    match state.pipeline.process_payload(&body).await {
        Ok(outcome) => {
            if outcome.batch_failed() {
                warn!("Invocation closed its batch in error");
            }
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => {
            let status = if e.is_rejection() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let overall = state.health.overall_status();

    let components = state
        .health
        .all_statuses()
        .iter()
        .map(|(k, v)| (k.clone(), ComponentStatusResponse::from(v)))
        .collect();

    let status_str = match overall {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
    };

    let response = HealthResponse {
        status: status_str.to_string(),
        components,
    };

    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Liveness probe: the process is serving requests.
async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe handler.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vload_core::health::Component;
    use vload_core::load::PgWireConnector;
    use vload_core::notify::LogNotifier;
    use vload_core::secrets::PlaintextUnwrapper;
    use vload_core::store::MemoryStateStore;
    use vload_core::{Config, Services};

    fn state() -> Arc<ServerState> {
        let services = Services::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(PlaintextUnwrapper),
            Arc::new(LogNotifier),
            Arc::new(PgWireConnector::new()),
        );
        Arc::new(ServerState::new(Pipeline::new(&services, &Config::default())))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_component_status_conversion() {
        let response: ComponentStatusResponse = (&ComponentStatus::Healthy).into();
        assert_eq!(response.status, "healthy");
        assert!(response.message.is_none());

        let degraded = ComponentStatus::Degraded("slow".to_string());
        let response: ComponentStatusResponse = (&degraded).into();
        assert_eq!(response.status, "degraded");
        assert_eq!(response.message, Some("slow".to_string()));

        let unhealthy = ComponentStatus::Unhealthy("down".to_string());
        let response: ComponentStatusResponse = (&unhealthy).into();
        assert_eq!(response.status, "unhealthy");
        assert_eq!(response.message, Some("down".to_string()));

        let response: ComponentStatusResponse = (&ComponentStatus::Unknown).into();
        assert_eq!(response.status, "unknown");
    }

    #[tokio::test]
    async fn test_event_for_unconfigured_prefix() {
        let payload = serde_json::json!({
            "Records": [{
                "eventSource": "aws:s3",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "bucket": { "name": "landing" },
                    "object": { "key": "orders/2024/a.csv" }
                }
            }]
        });
        let body = Bytes::from(serde_json::to_vec(&payload).unwrap());

        let response = events_handler(State(state()), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["outcome"], "unconfigured");
        assert_eq!(json["prefix"], "landing/orders/2024");
    }

    #[tokio::test]
    async fn test_rejected_event_is_bad_request() {
        let body = Bytes::from_static(b"{\"Records\": [{\"eventSource\": \"aws:sqs\"}]}");
        let response = events_handler(State(state()), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());

        let response = events_handler(State(state()), Bytes::from_static(b"not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_unhealthy_store() {
        let state = state();
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.health.mark_unhealthy(Component::Store, "connection refused");
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["components"]["store"]["status"], "unhealthy");
        assert_eq!(
            readyz_handler(State(state)).await.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = state();
        state.metrics.record_event();
        let response = metrics_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("vload_events_total 1"));
    }
}
