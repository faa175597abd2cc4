//! HTTP Admin API
//!
//! Command push and device status endpoints for operators, plus the
//! Prometheus metrics endpoint. The `/api/*` routes require a bearer token
//! derived daily from the signature key.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ring::digest;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::debug;

use crate::metrics::GatewayMetrics;
use crate::registry::DeviceRegistry;

/// How long a pushed command waits for the device's response.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<DeviceRegistry>,
    pub metrics: GatewayMetrics,
    pub signature_key: String,
}

/// The admin bearer token for a given local date: hex SHA-256 of
/// `yyyy-MM-dd` concatenated with the signature key.
pub fn daily_token(date: &str, signature_key: &str) -> String {
    let mut input = Vec::with_capacity(date.len() + signature_key.len());
    input.extend_from_slice(date.as_bytes());
    input.extend_from_slice(signature_key.as_bytes());
    hex::encode(digest::digest(&digest::SHA256, &input).as_ref())
}

fn current_token(signature_key: &str) -> String {
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    daily_token(&date, signature_key)
}

/// Middleware enforcing the daily bearer token on `/api/*` routes.
async fn api_auth_middleware(
    State(state): State<AdminState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path().starts_with("/api/") {
        let expected = current_token(&state.signature_key);
        let auth_header = request.headers().get(header::AUTHORIZATION);
        let is_authorized = auth_header.is_some_and(|h| {
            h.to_str()
                .map(|s| {
                    s.strip_prefix("Bearer ")
                        .is_some_and(|token| token == expected)
                })
                .unwrap_or(false)
        });

        if !is_authorized {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                "Unauthorized",
            )
                .into_response();
        }
    }

    next.run(request).await
}

/// Creates the admin router.
pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/commands/:device_id", post(command_handler))
        .route("/api/devices/status", post(status_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_auth_middleware,
        ))
        .with_state(state)
}

/// Publishes a command on the device's reply topic and waits for the
/// paired response (the next device message of the same type).
async fn command_handler(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
    Json(command): Json<Value>,
) -> Response {
    let conn = match state.registry.get(&device_id) {
        Some(c) => c,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "device not connected"})),
            )
                .into_response();
        }
    };

    let msg_type = match command.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "command requires a type"})),
            )
                .into_response();
        }
    };

    let response_rx = conn.register_pending(msg_type);
    conn.publish_json(&command);
    debug!("pushed {} command to {}", command["type"], device_id);

    match timeout(COMMAND_TIMEOUT, response_rx).await {
        Ok(Ok(response)) => Json(response).into_response(),
        // The waiter was superseded by a newer command of the same type.
        Ok(Err(_)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "command superseded"})),
        )
            .into_response(),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "device did not respond"})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct StatusRequest {
    macs: Vec<String>,
}

/// Returns a liveness boolean per requested MAC.
async fn status_handler(
    State(state): State<AdminState>,
    Json(request): Json<StatusRequest>,
) -> impl IntoResponse {
    let statuses: serde_json::Map<String, Value> = request
        .macs
        .into_iter()
        .map(|mac| {
            let alive = state
                .registry
                .get(&mac)
                .map(|conn| conn.is_alive())
                .unwrap_or(false);
            (mac, Value::Bool(alive))
        })
        .collect();

    Json(Value::Object(statuses))
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state() -> AdminState {
        AdminState {
            registry: Arc::new(DeviceRegistry::new()),
            metrics: GatewayMetrics::new(),
            signature_key: "test".to_string(),
        }
    }

    fn bearer(state: &AdminState) -> String {
        format!("Bearer {}", current_token(&state.signature_key))
    }

    #[test]
    fn test_daily_token_is_sha256_of_date_and_key() {
        // SHA-256("2024-01-01test")
        let token = daily_token("2024-01-01", "test");
        assert_eq!(token.len(), 64);
        assert_eq!(token, daily_token("2024-01-01", "test"));
        assert_ne!(token, daily_token("2024-01-02", "test"));
        assert_ne!(token, daily_token("2024-01-01", "other"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_needs_no_auth() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_rejects_missing_token() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/devices/status")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"macs":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_status_reports_unknown_macs_as_offline() {
        let state = create_test_state();
        state
            .registry
            .insert(Connection::for_tests("a0:85:e3:f4:49:34", 60));
        let auth = bearer(&state);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/devices/status")
                    .header("content-type", "application/json")
                    .header("authorization", auth)
                    .body(Body::from(
                        r#"{"macs":["a0:85:e3:f4:49:34","00:00:00:00:00:01"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();

        // Registered but sessionless: present, not alive.
        assert_eq!(body["a0:85:e3:f4:49:34"], Value::Bool(false));
        assert_eq!(body["00:00:00:00:00:01"], Value::Bool(false));
    }

    #[tokio::test]
    async fn test_command_to_unknown_device_is_404() {
        let state = create_test_state();
        let auth = bearer(&state);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/commands/a0:85:e3:f4:49:34")
                    .header("content-type", "application/json")
                    .header("authorization", auth)
                    .body(Body::from(r#"{"type":"volume","level":5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_command_without_type_is_400() {
        let state = create_test_state();
        state
            .registry
            .insert(Connection::for_tests("a0:85:e3:f4:49:34", 60));
        let auth = bearer(&state);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/commands/a0:85:e3:f4:49:34")
                    .header("content-type", "application/json")
                    .header("authorization", auth)
                    .body(Body::from(r#"{"level":5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
