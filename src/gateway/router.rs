//! HTTP router and handlers for the management API

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::Error;
use crate::failsafe::CircuitBreakerRegistry;

/// Shared application state
pub struct AppState {
    /// Breaker registry
    pub registry: Arc<CircuitBreakerRegistry>,
    /// Prometheus handle backing `/metrics`
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    /// State without a metrics exporter
    #[must_use]
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            registry,
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    /// Serve `/metrics` from `handle`
    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Query string of the reset endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ResetParams {
    /// Also zero lifetime totals and the cached response
    #[serde(default)]
    pub hard: bool,
}

/// Create the router for `registry`
pub fn create_router(registry: Arc<CircuitBreakerRegistry>) -> Router {
    router_with_state(Arc::new(AppState::new(registry)))
}

/// Create the router from prepared state
pub fn router_with_state(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/circuit-breakers", get(list_handler))
        .route("/circuit-breakers/health", get(health_handler))
        .route("/circuit-breakers/reset-all", post(reset_all_handler))
        .route("/circuit-breakers/{name}", get(get_handler))
        .route("/circuit-breakers/{name}/reset", post(reset_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .fallback(not_found_handler)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn liveness_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /circuit-breakers
async fn list_handler(State(state): State<Arc<AppState>>) -> Response {
    let all = state.registry.metrics_all();
    let count = all.len();
    match to_json(&all) {
        Ok(breakers) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "breakers": breakers,
                "count": count
            })),
        )
            .into_response(),
        Err(response) => response,
    }
}

/// GET /circuit-breakers/{name}
async fn get_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let Some(snapshot) = state.registry.metrics(&name) else {
        return error_response(&Error::UnknownBreaker(name));
    };
    match to_json(&snapshot) {
        Ok(breaker) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "breaker": breaker
            })),
        )
            .into_response(),
        Err(response) => response,
    }
}

/// POST /circuit-breakers/{name}/reset
async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<ResetParams>,
) -> Response {
    match state.registry.reset(&name, params.hard) {
        Ok(()) => {
            info!(breaker = %name, hard = params.hard, "Reset via management API");
            let message = if params.hard {
                format!("Circuit breaker '{name}' hard reset")
            } else {
                format!("Circuit breaker '{name}' reset")
            };
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": message
                })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// POST /circuit-breakers/reset-all
async fn reset_all_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResetParams>,
) -> impl IntoResponse {
    let count = state.registry.reset_all(params.hard);
    Json(json!({
        "success": true,
        "message": format!("All circuit breakers reset ({count})")
    }))
}

/// GET /circuit-breakers/health
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.registry.health();
    match to_json(&report) {
        Ok(Value::Object(mut body)) => {
            body.insert("success".to_string(), Value::Bool(true));
            (StatusCode::OK, Json(Value::Object(body))).into_response()
        }
        Ok(_) => error_response(&Error::Internal("health report is not an object".to_string())),
        Err(response) => response,
    }
}

/// GET /metrics
#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "Metrics exporter not installed"
            })),
        )
            .into_response(),
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "Not found"
        })),
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, Response> {
    serde_json::to_value(value).map_err(|e| error_response(&Error::Json(e)))
}

/// Structured error body: 404 for unknown breakers, 500 otherwise
fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::UnknownBreaker(_) => StatusCode::NOT_FOUND,
        _ => {
            error!(error = %e, "Management request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = match e {
        Error::UnknownBreaker(name) => format!("Circuit breaker '{name}' not found"),
        _ => e.to_string(),
    };
    (
        status,
        Json(json!({
            "success": false,
            "error": message
        })),
    )
        .into_response()
}

fn panic_response(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    error!("Management handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": "Internal server error"
        })),
    )
        .into_response()
}
