//! Webhook ingestion endpoints
//!
//! The provider webhook and the bot message log endpoint. Both sit
//! outside the authenticated `/api` surface: the webhook authenticates
//! with an HMAC signature over the raw body, the bot endpoint with an
//! opaque token in the URL.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
};

use crate::AppState;
use crate::api::dto::{BotLogRequest, MessageResponse};
use crate::data::{ChannelStatus, MessageSource};
use crate::error::AppError;
use crate::line::signature::{SIGNATURE_HEADER, verify_signature};
use crate::service::WebhookEnvelope;

/// Verify the delivery signature before touching the body.
///
/// A missing header is treated the same as a bad one unless unsigned
/// webhooks are explicitly allowed in configuration (local testing).
fn check_signature(
    state: &AppState,
    channel_secret: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(signature) => verify_signature(channel_secret, body, signature),
        None if state.config.line.allow_unsigned_webhooks => {
            tracing::warn!("Accepting unsigned webhook delivery (allow_unsigned_webhooks is on)");
            Ok(())
        }
        None => Err(AppError::InvalidSignature),
    }
}

/// `POST /webhook/:channel_id`
///
/// Always replies 200 once events were attempted; per-event failures
/// are logged and counted, never bubbled to the provider (which would
/// trigger a redelivery of the whole batch).
async fn receive_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let channel = state
        .db
        .get_channel(&channel_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if channel.status != ChannelStatus::Active.as_str() {
        return Err(AppError::NotFound);
    }

    check_signature(&state, &channel.channel_secret, &headers, &body)?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("malformed webhook body: {e}")))?;

    tracing::debug!(
        channel_id = %channel.id,
        events = envelope.events.len(),
        "Webhook delivery received"
    );

    state.ingest.process_envelope(&channel, envelope).await;

    Ok(Json(serde_json::json!({ "success": true })))
}

/// `POST /bot-messages/log/:token`
///
/// Logs a message an external bot already sent through its own
/// channel credentials. No provider call; persist and notify only.
async fn log_bot_message(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(request): Json<BotLogRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let account = state
        .db
        .get_account_by_bot_token(&token)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let channel = match &request.channel_id {
        Some(id) => state.db.get_channel(id).await?.ok_or(AppError::NotFound)?,
        None => state
            .db
            .get_default_channel_for_account(&account.id)
            .await?
            .ok_or(AppError::NotFound)?,
    };
    if channel.account_id != account.id {
        return Err(AppError::Forbidden);
    }

    let user = state
        .resolver
        .resolve_user(&channel, &request.line_user_id)
        .await?;
    let (conversation, _) = state
        .resolver
        .resolve_conversation(&channel.id, &user.id)
        .await?;

    let message = state
        .dispatcher
        .record_sent(&channel, &conversation, request.payload()?, MessageSource::BotReply)
        .await?;

    Ok(Json(MessageResponse { message }))
}

pub fn webhook_router() -> Router<AppState> {
    Router::new()
        .route("/webhook/:channel_id", post(receive_webhook))
        .route("/bot-messages/log/:token", post(log_bot_message))
}
