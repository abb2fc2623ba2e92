//! HTTP surface of the broker.
//!
//! # Endpoints
//!
//! - `GET /health`: liveness and connection count
//! - `GET /sync?userId=<identity>`: WebSocket upgrade into a sync connection
//! - `GET /events?entityType=&entityId=`: newest logged events as JSON

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use esg_sync_core::{validate_identity, InvalidIdentity};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::broker::Broker;
use super::connection::serve_socket;
use super::event_log::{EventFilter, EventLogRecord};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// Builds the broker's router.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", get(sync))
        .route("/events", get(events))
        .with_state(AppState { broker })
        .layer(TraceLayer::new_for_http())
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

/// Reasons a sync connection is refused before the upgrade.
#[derive(Debug)]
pub enum HandshakeError {
    MissingIdentity,
    InvalidIdentity(InvalidIdentity),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::MissingIdentity => write!(f, "userId query parameter required"),
            HandshakeError::InvalidIdentity(e) => write!(f, "Invalid userId: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let error = match self {
            HandshakeError::MissingIdentity => "missing_identity",
            HandshakeError::InvalidIdentity(_) => "invalid_identity",
        };
        error_response(StatusCode::BAD_REQUEST, error, self.to_string())
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connections: usize,
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.broker.connection_count().await,
    })
}

#[derive(Debug, Deserialize)]
struct SyncParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// WebSocket endpoint. The identity is checked before upgrading.
async fn sync(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match params.user_id {
        None => return HandshakeError::MissingIdentity.into_response(),
        Some(raw) => match validate_identity(&raw) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Rejected sync handshake: {}", e);
                return HandshakeError::InvalidIdentity(e).into_response();
            }
        },
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let broker = state.broker;
    ws.on_upgrade(move |socket| serve_socket(broker, socket, identity))
}

/// Event log query endpoint
async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<Vec<EventLogRecord>>, Response> {
    state.broker.log().query(&filter).await.map(Json).map_err(|e| {
        tracing::error!("Event query failed: {}", e);
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            e.to_string(),
        )
    })
}
