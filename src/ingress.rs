//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Embedded HTTP listener accepting events pushed directly by peers, using Axum.
// Valid requests become events on the same queue the broker path feeds, which
// keeps the two ingestion paths structurally symmetric.
//
// | Component      | Description                                                |
// |----------------|------------------------------------------------------------|
// | IngressState   | Shared state: queue handle, policies, connection watch     |
// | router         | Builds the Axum router (POST <path>, GET /health)          |
// | serve          | Binds the listener and runs until cancellation             |
// | IngressError   | Request-level error types mapped to HTTP responses         |
//--------------------------------------------------------------------------------------------------

use axum::{
    Extension, Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::broker::ConnectionState;
use crate::config::OverloadPolicy;
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{Event, EventSource};
use crate::queue::{EventQueue, PushOutcome};

/// Type alias for Result with IngressError
pub type IngressResult<T> = Result<T, IngressError>;

/// Request-level errors for the ingress endpoint
#[derive(Error, Debug, Clone)]
pub enum IngressError {
    /// The request body was malformed or failed validation
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The event queue is full and the overload policy rejects producers
    #[error("event queue is full")]
    Overloaded,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Overloaded => (
                StatusCode::TOO_MANY_REQUESTS,
                "event queue is full".to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Shared application state accessible by all ingress handlers
pub struct IngressState {
    pub queue: Arc<EventQueue>,
    pub overload_policy: OverloadPolicy,
    pub connection: watch::Receiver<ConnectionState>,
}

/// Body accepted by the ingress endpoint
#[derive(Debug, Deserialize)]
pub struct IngressEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(rename = "correlationId", default)]
    pub correlation_id: Option<String>,
}

/// Builds the ingress router
pub fn router(state: Arc<IngressState>, path: &str) -> Router {
    Router::new()
        .route(path, post(ingest_event))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

/// Accepts one pushed event and enqueues it.
///
/// Validation failures are rejected at the boundary and never enqueued. A
/// push that displaced the oldest entry is still acknowledged under the
/// default policy: ingestion success does not imply eventual delivery.
async fn ingest_event(
    Extension(state): Extension<Arc<IngressState>>,
    Json(req): Json<IngressEventRequest>,
) -> IngressResult<Response> {
    if req.event_type.trim().is_empty() {
        return Err(IngressError::BadRequest(
            "event type must not be empty".to_string(),
        ));
    }

    let mut event = Event::new(req.event_type, req.payload, EventSource::Http);
    if let Some(correlation_id) = req.correlation_id {
        event = event.with_correlation_id(correlation_id);
    }

    debug!(event_type = %event.event_type, "ingress event accepted");

    if state.queue.push(event).await == PushOutcome::DroppedOldest
        && state.overload_policy == OverloadPolicy::Reject
    {
        return Err(IngressError::Overloaded);
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response())
}

/// Health check reflecting the broker connection state
async fn health(Extension(state): Extension<Arc<IngressState>>) -> impl IntoResponse {
    let connection = *state.connection.borrow();
    Json(json!({
        "status": "ok",
        "connection": connection,
        "queued": state.queue.len(),
        "dropped": state.queue.dropped_count(),
    }))
}

/// Binds the listener and serves the router until the token is cancelled.
///
/// Returns the bound address (useful when listening on port 0) and the task
/// handle. Shutdown is graceful: in-flight requests finish, new connections
/// are refused.
///
/// # Errors
/// Returns `ConnectorError::Ingress` when binding the listen address fails.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    token: CancellationToken,
) -> ConnectorResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| ConnectorError::Ingress(err.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| ConnectorError::Ingress(err.to_string()))?;

    info!(%local_addr, "http ingress listening");

    let handle = tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(%err, "http ingress server error");
        }
        info!("http ingress stopped");
    });

    Ok((local_addr, handle))
}
