//! Management API tests

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use circuit_breakers::config::RegistryConfig;
use circuit_breakers::failsafe::{Admission, CircuitBreakerRegistry, Outcome};
use circuit_breakers::gateway::create_router;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::time::Instant;
use tower::ServiceExt;

fn setup() -> (Arc<CircuitBreakerRegistry>, Router) {
    let registry = Arc::new(CircuitBreakerRegistry::new(RegistryConfig::default()).unwrap());
    let router = create_router(Arc::clone(&registry));
    (registry, router)
}

fn trip(registry: &CircuitBreakerRegistry, name: &str) {
    let breaker = registry.get(name).unwrap();
    let now = Instant::now();
    while let Admission::Allowed(permit) = breaker.allow(now) {
        breaker.record(permit, Outcome::Failure, now);
    }
}

async fn send(router: Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = router
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn list_returns_every_breaker() {
    let (_, router) = setup();
    let (status, body) = send(router, Method::GET, "/circuit-breakers").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["count"], json!(4));
    for name in ["database", "external_api", "cache", "rag_service"] {
        assert_eq!(body["breakers"][name]["state"], json!("closed"), "{name}");
    }
}

#[tokio::test]
async fn get_returns_snapshot_fields() {
    let (_, router) = setup();
    let (status, body) = send(router, Method::GET, "/circuit-breakers/database").await;

    assert_eq!(status, StatusCode::OK);
    let breaker = &body["breaker"];
    assert_eq!(breaker["name"], json!("database"));
    assert_eq!(breaker["state"], json!("closed"));
    assert_eq!(breaker["successes_total"], json!(0));
    assert_eq!(breaker["failures_total"], json!(0));
    assert_eq!(breaker["timeouts_total"], json!(0));
    assert_eq!(breaker["current_window_count"], json!(0));
    assert_eq!(breaker["current_failure_rate"], Value::Null);
    assert_eq!(breaker["fallback_strategy"], json!("fail"));
    assert!(breaker["state_changed_at"].is_string());
}

#[tokio::test]
async fn unknown_breaker_is_structured_404() {
    let (_, router) = setup();
    let (status, body) = send(router, Method::GET, "/circuit-breakers/ghost").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        json!({"success": false, "error": "Circuit breaker 'ghost' not found"})
    );
}

#[tokio::test]
async fn reset_closes_an_open_breaker() {
    let (registry, router) = setup();
    trip(&registry, "external_api");
    assert_eq!(registry.metrics("external_api").unwrap().failures_total, 10);

    let (status, body) = send(router, Method::POST, "/circuit-breakers/external_api/reset").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    let snap = registry.metrics("external_api").unwrap();
    assert_eq!(snap.state.as_str(), "closed");
    assert_eq!(snap.failures_total, 10);
}

#[tokio::test]
async fn hard_reset_zeroes_totals() {
    let (registry, router) = setup();
    trip(&registry, "cache");

    let (status, body) = send(router, Method::POST, "/circuit-breakers/cache/reset?hard=true").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], json!("Circuit breaker 'cache' hard reset"));
    assert_eq!(registry.metrics("cache").unwrap().failures_total, 0);
}

#[tokio::test]
async fn reset_of_unknown_breaker_is_404() {
    let (_, router) = setup();
    let (status, body) = send(router, Method::POST, "/circuit-breakers/ghost/reset").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn reset_all_resets_every_breaker() {
    let (registry, router) = setup();
    trip(&registry, "database");
    trip(&registry, "rag_service");

    let (status, body) = send(router, Method::POST, "/circuit-breakers/reset-all").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert!(registry.health().open_breakers.is_empty());
}

#[tokio::test]
async fn health_reports_degraded_when_a_breaker_is_open() {
    let (registry, router) = setup();

    let (_, body) = send(router.clone(), Method::GET, "/circuit-breakers/health").await;
    assert_eq!(body["health"], json!("healthy"));
    assert_eq!(body["total_breakers"], json!(4));

    trip(&registry, "database");
    let (status, body) = send(router, Method::GET, "/circuit-breakers/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "success": true,
            "health": "degraded",
            "open_breakers": ["database"],
            "half_open_breakers": [],
            "closed_breakers": ["cache", "external_api", "rag_service"],
            "total_breakers": 4
        })
    );
}

#[tokio::test]
async fn liveness_and_unknown_routes() {
    let (_, router) = setup();

    let (status, body) = send(router.clone(), Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));

    let (status, body) = send(router, Method::GET, "/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}
