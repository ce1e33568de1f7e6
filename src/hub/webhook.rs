//! Inbound execution-provider webhooks.
//!
//! Bodies are signed with HMAC-SHA256 over the raw bytes, hex encoded in the
//! `x-blackbox-signature` header. When no secret is configured every
//! delivery is accepted unsigned.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use super::api::SharedState;
use super::lifecycle::{EventOutcome, ProviderTaskPayload, TaskEvent, apply_event};
use super::models::Task;
use super::ws::{self, WsMessage};

pub const SIGNATURE_HEADER: &str = "x-blackbox-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub task: Option<ProviderTaskPayload>,
}

fn keyed_mac(secret: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac)
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    keyed_mac(secret, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time check of `signature` against `body`.
pub fn verify_signature(secret: Option<&str>, body: &[u8], signature: Option<&str>) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        tracing::debug!("webhook secret not configured, skipping signature check");
        return true;
    };
    let Some(expected) = signature.and_then(|s| hex::decode(s.trim()).ok()) else {
        return false;
    };
    keyed_mac(secret, body).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// `POST /api/webhooks/blackbox`
pub async fn blackbox_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_signature(state.webhook_secret.as_deref(), &body, signature) {
        tracing::warn!("rejected webhook with invalid signature");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let parsed: WebhookBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "malformed webhook body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };
    let payload = parsed.task.unwrap_or_default();
    let Some(external_id) = payload.id.clone().filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing task ID");
    };
    let event = TaskEvent::parse(&parsed.event);
    tracing::debug!(event = event.as_str(), %external_id, "webhook received");

    let options = state.lifecycle;
    let outcome = state
        .db
        .call(move |db| {
            let outcome = apply_event(db, &external_id, &event, &payload, options, Utc::now())?;
            let mut promoted: Vec<Task> = Vec::new();
            if let EventOutcome::Applied(applied) = &outcome {
                for id in &applied.promoted {
                    if let Some(task) = db.get_task(id)? {
                        promoted.push(task);
                    }
                }
            }
            Ok((outcome, promoted))
        })
        .await;

    match outcome {
        Ok((EventOutcome::TaskNotFound, _)) => {
            Json(json!({ "received": true, "message": "Task not found" })).into_response()
        }
        Ok((EventOutcome::Ignored { task_id }, _)) => {
            Json(json!({ "received": true, "taskId": task_id })).into_response()
        }
        Ok((EventOutcome::Duplicate { task_id }, _)) => {
            Json(json!({ "received": true, "taskId": task_id, "duplicate": true })).into_response()
        }
        Ok((EventOutcome::Applied(applied), promoted)) => {
            let task_id = applied.task.id.clone();
            ws::broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: applied.task });
            if let Some(message) = applied.message {
                ws::broadcast_message(&state.ws_tx, &WsMessage::MessageCreated { message });
            }
            for task in promoted {
                ws::broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task });
            }
            Json(json!({ "received": true, "taskId": task_id })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "webhook processing failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Webhook processing failed")
        }
    }
}
