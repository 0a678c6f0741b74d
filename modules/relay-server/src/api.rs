//! HTTP adapter: command submission and outcome lookup over the same
//! dispatch pipeline the gateway feeds.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use relay_common::{Command, CommandKind, CommandOrigin, RelayError};
use relay_dispatch::{Dispatcher, OutcomeStore};
use relay_store::CommandStore;

pub struct AppState {
    pub dispatcher: Dispatcher<CommandStore>,
    pub store: Arc<CommandStore>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/commands", post(submit_command))
        .route("/commands/{key}", get(get_outcome))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct SubmitRequest {
    /// Caller-supplied dedup key. Omitted means the request is not
    /// idempotent across retries and gets a fresh key.
    idempotency_key: Option<String>,
    resource_key: String,
    kind: CommandKind,
    payload: serde_json::Value,
    /// How long the caller will wait for the outcome. On expiry the
    /// request answers 202 pending; the command itself keeps running.
    deadline_ms: Option<u64>,
}

async fn submit_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    if body.resource_key.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "resource_key must not be empty" })),
        )
            .into_response();
    }

    let mut cmd = Command::new(body.kind, body.resource_key, body.payload, CommandOrigin::Api);
    if let Some(key) = body.idempotency_key {
        if key.trim().is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "idempotency_key must not be empty when supplied" })),
            )
                .into_response();
        }
        cmd = cmd.with_idempotency_key(key);
    }

    if let Some(ms) = body.deadline_ms {
        match chrono::Duration::from_std(Duration::from_millis(ms)) {
            Ok(age) => cmd = cmd.with_deadline(Utc::now() + age),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "deadline_ms out of range" })),
                )
                    .into_response();
            }
        }
    }
    // The command's own deadline drives the caller's wait. Processing
    // continues past it either way.
    let wait = cmd.deadline.map(remaining_wait);

    let key = cmd.idempotency_key.clone();
    debug!(key = %key, kind = cmd.kind.as_str(), "Command submitted over HTTP");

    let waiter = match state.dispatcher.enqueue(cmd).await {
        Ok(waiter) => waiter,
        Err(e) => return error_response(e),
    };

    // Submissions always answer 202: the command was accepted whether or
    // not it settled within the caller's deadline.
    match wait {
        Some(w) => match tokio::time::timeout(w, waiter.wait()).await {
            Ok(Ok(outcome)) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
            Ok(Err(e)) => error_response(e),
            // Deadline expired: the command keeps running and its outcome
            // stays queryable under the returned key.
            Err(_) => (
                StatusCode::ACCEPTED,
                Json(json!({ "idempotency_key": key, "status": "pending" })),
            )
                .into_response(),
        },
        None => match waiter.wait().await {
            Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
            Err(e) => error_response(e),
        },
    }
}

async fn get_outcome(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.store.lookup(&key).await {
        Ok(Some(outcome)) => Json(outcome).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no outcome recorded for this idempotency key" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: RelayError) -> axum::response::Response {
    let status = error_status(&e);
    (
        status,
        Json(json!({
            "error": e.to_string(),
            "kind": e.failure_kind().as_str(),
        })),
    )
        .into_response()
}

/// Time left before an API deadline, saturating at zero once it has passed.
fn remaining_wait(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn error_status(e: &RelayError) -> StatusCode {
    match e {
        RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::Conflict(_) => StatusCode::CONFLICT,
        RelayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        RelayError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::TransientIo(_) | RelayError::FatalProtocol(_) => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_map_to_http() {
        assert_eq!(
            error_status(&RelayError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&RelayError::PoolExhausted("full".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&RelayError::TransientIo("reset".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn remaining_wait_saturates_at_zero_once_expired() {
        let expired = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(remaining_wait(expired), Duration::ZERO);

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert!(remaining_wait(future) > Duration::from_secs(4));
    }

    #[test]
    fn unknown_command_kind_is_rejected() {
        let raw = json!({
            "resource_key": "r1",
            "kind": "escalate",
            "payload": {}
        });
        let parsed: Result<SubmitRequest, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }
}
