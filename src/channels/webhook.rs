//! Inbound webhook — enqueue-and-ack.
//!
//! The handler only validates the envelope shape and drops it into the inbox
//! queue; all processing happens in the drain worker so a slow handler never
//! blocks message intake.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::channels::transport::InboundMessage;
use crate::store::Database;

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub store: Arc<dyn Database>,
}

/// POST /webhook
///
/// Accepts one inbound message envelope, enqueues it, returns 200. Duplicate
/// deliveries (same message id) are acknowledged without re-queueing.
async fn receive_message(
    State(state): State<WebhookState>,
    Json(envelope): Json<InboundMessage>,
) -> impl IntoResponse {
    // Reject envelopes whose declared type and body disagree before queueing.
    if let Err(e) = envelope.payload() {
        tracing::warn!(error = %e, "Rejecting malformed webhook envelope");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response();
    }

    let payload = match serde_json::to_value(&envelope) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    match state.store.enqueue_inbox(&envelope.id, &payload).await {
        Ok(true) => {
            tracing::debug!(message_id = %envelope.id, from = %envelope.from, "Message queued");
            StatusCode::OK.into_response()
        }
        Ok(false) => {
            tracing::debug!(message_id = %envelope.id, "Duplicate delivery ignored");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to enqueue inbound message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "queue failure"})),
            )
                .into_response()
        }
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the webhook router.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(receive_message))
        .route("/health", get(health))
        .with_state(state)
}
