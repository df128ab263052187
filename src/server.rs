//! HTTP API for the dashboard.
//!
//! This module provides a localhost server that:
//! - Serves the dashboard snapshot via GET /api/dash/monolithic
//! - Starts and stops study sessions
//! - Runs an on-demand capture via POST /api/capture/once
//! - Lists archived sessions
//! - Serves captured images under /images and the dashboard assets at /
//!
//! # Architecture
//!
//! ```text
//! Dashboard ──→ /api/* ──→ FocusMonitor ──→ capture programs
//!    │                          ↓
//!    └──→ /images/latest.jpg   [Gemini analysis]
//! ```

use crate::capture::CycleError;
use crate::inference::Analysis;
use crate::session::{FocusMonitor, Session, SessionSummary, StudyStats};
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Acknowledgement for session control requests
#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// GET /api/health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/dash/monolithic
async fn dashboard(State(monitor): State<Arc<FocusMonitor>>) -> Json<StudyStats> {
    Json(monitor.snapshot())
}

/// POST /api/session/start
async fn start_session(State(monitor): State<Arc<FocusMonitor>>) -> Json<OkResponse> {
    monitor.start_session();
    Json(OkResponse { ok: true })
}

/// POST /api/session/stop
async fn stop_session(State(monitor): State<Arc<FocusMonitor>>) -> Json<OkResponse> {
    monitor.stop_session();
    Json(OkResponse { ok: true })
}

/// POST /api/capture/once
///
/// Runs a full capture cycle outside the scheduler. Local capture failures
/// map to 500, inference failures to 502.
async fn capture_once(
    State(monitor): State<Arc<FocusMonitor>>,
) -> Result<Json<Analysis>, ApiError> {
    monitor.capture_once().await.map(Json).map_err(|e| {
        tracing::error!("On-demand capture failed: {}", e);
        cycle_error(&e)
    })
}

fn cycle_error(e: &CycleError) -> ApiError {
    if e.is_upstream() {
        api_error(StatusCode::BAD_GATEWAY, "INFERENCE_ERROR", e.to_string())
    } else {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CAPTURE_ERROR",
            e.to_string(),
        )
    }
}

/// GET /api/sessions
async fn list_sessions(State(monitor): State<Arc<FocusMonitor>>) -> Json<Vec<SessionSummary>> {
    Json(monitor.sessions())
}

/// GET /api/sessions/:start
///
/// `start` is the session's start time in RFC 3339.
async fn get_session(
    State(monitor): State<Arc<FocusMonitor>>,
    Path(start): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let start: DateTime<Utc> = DateTime::parse_from_rfc3339(&start)
        .map_err(|e| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_TIMESTAMP",
                format!("Invalid start time {start:?}: {e}"),
            )
        })?
        .with_timezone(&Utc);

    monitor.session_started_at(start).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("No session started at {}", start.to_rfc3339()),
        )
    })
}

/// Build the application router.
pub fn router(monitor: Arc<FocusMonitor>) -> Router {
    let paths = monitor.paths().clone();

    Router::new()
        .route("/api/health", get(health))
        .route("/api/dash/monolithic", get(dashboard))
        .route("/api/session/start", post(start_session))
        .route("/api/session/stop", post(stop_session))
        .route("/api/capture/once", post(capture_once))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:start", get(get_session))
        .nest_service("/images", ServeDir::new(&paths.images_dir))
        .fallback_service(ServeDir::new(&paths.static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                    HeaderValue::from_static("http://localhost:3000"),
                    HeaderValue::from_static("http://localhost:5173"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(monitor)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    monitor: Arc<FocusMonitor>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(monitor);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Focus monitor listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;
    use crate::CaptureKind;

    #[test]
    fn test_cycle_error_status() {
        let (status, body) = cycle_error(&CycleError::Inference(InferenceError::AuthMissing));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.code, "INFERENCE_ERROR");

        let (status, body) = cycle_error(&CycleError::Image(crate::CaptureError::IncompleteSignal {
            kind: CaptureKind::Image,
        }));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code, "CAPTURE_ERROR");
    }
}
