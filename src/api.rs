//! Operator HTTP endpoints and the HTTP admission entry point.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::app::App;
use crate::envelope::{AdmissionRequest, AdmissionResponse, AdmissionStatus};
use crate::error::OfficeError;

/// Queue name addressing every throttle queue at once.
const ALL_QUEUES: &str = "all";

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/queues", get(queue_status))
        .route("/queues/:name/start", post(start_queue))
        .route("/queues/:name/stop", post(stop_queue))
        .route("/post", post(admit_message))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

fn require_token(app: &App, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(app.security.header_name())
        .and_then(|v| v.to_str().ok());
    if app.security.validate_api_token(token) {
        Ok(())
    } else {
        tracing::warn!(target: "postoffice::security", "Rejected operator request with missing or invalid API token");
        Err(ApiError::Unauthorized)
    }
}

/// Liveness, with a summary of the router
async fn health_check(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "postoffice",
        "version": env!("CARGO_PKG_VERSION"),
        "postOffice": app.post_office.health(),
    }))
}

/// Readiness - verifies the broker connection
async fn readiness_check(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>, StatusCode> {
    if app.broker.is_connected() {
        Ok(Json(json!({
            "status": "ready",
            "service": "postoffice",
            "broker": "connected",
        })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn queue_status(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_token(&app, &headers)?;
    Ok(Json(json!({
        "status": "success",
        "queues": app.manager.queue_status(),
        "timestamp": Utc::now(),
    })))
}

async fn start_queue(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_token(&app, &headers)?;
    tracing::info!(queue = %name, "Queue start requested");

    if name == ALL_QUEUES {
        app.manager.start_all_throttle_queues().await?;
    } else {
        app.manager.start_queue(&name).await?;
    }
    Ok(Json(control_response("start", &name)))
}

async fn stop_queue(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_token(&app, &headers)?;
    tracing::info!(queue = %name, "Queue stop requested");

    if name == ALL_QUEUES {
        app.manager.stop_all_throttle_queues().await?;
    } else {
        app.manager.stop_queue(&name).await?;
    }
    Ok(Json(control_response("stop", &name)))
}

fn control_response(action: &str, queue: &str) -> serde_json::Value {
    json!({
        "status": "success",
        "action": action,
        "queue": queue,
        "message": format!("Queue {} completed", action),
        "timestamp": Utc::now(),
    })
}

/// Admit a message onto the post-office queue
///
/// The body is taken as raw JSON so the secret is checked before its shape.
async fn admit_message(
    State(app): State<Arc<App>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<AdmissionResponse>), ApiError> {
    if let Err(e) = app.security.validate_admission_secret(AdmissionRequest::secret_in(&body)) {
        tracing::warn!(target: "postoffice::security", "Rejected HTTP admission: {}", e);
        return Err(e.into());
    }

    let request: AdmissionRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::Rejected(format!("Malformed message: {}", e)))?;
    let message_id = app.postman.send_to_post_office(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AdmissionResponse {
            message_id,
            status: AdmissionStatus::Accepted,
            timestamp: Utc::now(),
        }),
    ))
}

// Error handling

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    Rejected(String),
    NotFound(String),
    Internal,
}

impl From<OfficeError> for ApiError {
    fn from(e: OfficeError) -> Self {
        match e {
            OfficeError::Unauthorized(_) => ApiError::Unauthorized,
            OfficeError::Admission(msg) => ApiError::Rejected(msg),
            OfficeError::UnknownQueue(name) => ApiError::NotFound(format!("Unknown queue: {}", name)),
            other => {
                // Details stay in the log, never in the response.
                tracing::error!("Request failed: {}", other);
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Rejected(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
