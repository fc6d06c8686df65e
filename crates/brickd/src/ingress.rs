//! HTTP ingress
//!
//! Local producers push gateway events over HTTP instead of speaking MQTT:
//!
//! - `POST /push`: body is published on the gateway's own events topic
//! - `GET /health`: current session state, 200 only while connected

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use brickd_gateway::{ConnectionState, GatewayError, GatewaySession};
use serde::Serialize;
use tower_http::trace::TraceLayer;

/// Error returned by ingress handlers
#[derive(Debug)]
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

/// Standard error response format
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

fn error_type(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::AckTimeout { .. } => "ack_timeout",
        GatewayError::BrokerRejection { .. } => "broker_rejection",
        GatewayError::Connection(_) => "connection",
        GatewayError::NotAttached(_) => "not_attached",
        GatewayError::SessionClosed => "session_closed",
        GatewayError::Attach { source, .. } | GatewayError::Detach { source, .. } => {
            error_type(source)
        }
        GatewayError::ConfigParse(_) | GatewayError::InvalidIdentity(_) => "bad_request",
        GatewayError::Credential(_) => "internal_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error_type = error_type(&self.0);
        let message = self.0.to_string();

        if status.is_server_error() {
            tracing::error!(error = error_type, %message, "Ingress error");
        } else if status.is_client_error() {
            tracing::debug!(error = error_type, %message, "Ingress client error");
        }

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Build the ingress router for a session
pub fn create_router(session: Arc<GatewaySession>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/push", post(push))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(session)
}

async fn push(
    State(session): State<Arc<GatewaySession>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(bytes = body.len(), "Ingress push");
    session.publish_as_gateway(body).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn health(State(session): State<Arc<GatewaySession>>) -> (StatusCode, String) {
    let state = session.state();
    let status = if state == ConnectionState::Connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, state.to_string())
}
