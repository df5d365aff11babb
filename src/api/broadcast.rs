//! Broadcast endpoints
//!
//! A synchronous variant that runs the campaign inside the request and
//! returns final counts, and a background variant that persists the
//! record, spawns the run, and lets the caller poll for progress.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use chrono::Utc;

use crate::AppState;
use crate::api::dto::{BroadcastRequest, BroadcastResponse, BroadcastRunResponse};
use crate::auth::CurrentUser;
use crate::data::{
    Account, Broadcast, BroadcastStatus, BroadcastType, Capability, Channel, EntityId,
    MessagePayload,
};
use crate::error::AppError;

async fn resolve_channel(
    state: &AppState,
    account: &Account,
    channel_id: Option<&str>,
) -> Result<Channel, AppError> {
    let channel = match channel_id {
        Some(id) => state.db.get_channel(id).await?.ok_or(AppError::NotFound)?,
        None => state
            .db
            .get_default_channel_for_account(&account.id)
            .await?
            .ok_or(AppError::NotFound)?,
    };
    state
        .gate
        .require(&account.id, &channel, Capability::Broadcast)
        .await?;
    Ok(channel)
}

fn build_broadcast(
    account: &Account,
    channel: &Channel,
    request: &BroadcastRequest,
    initial_status: BroadcastStatus,
) -> Result<Broadcast, AppError> {
    if BroadcastType::parse(&request.broadcast_type).is_none() {
        return Err(AppError::Validation(format!(
            "unknown broadcast type: {}",
            request.broadcast_type
        )));
    }

    // Text content is stored raw for readability in the row; any other
    // payload type is stored as its JSON form.
    let content = match &request.message {
        MessagePayload::Text { content } => content.clone(),
        other => serde_json::to_string(other)
            .map_err(|e| AppError::Validation(format!("unserializable payload: {e}")))?,
    };

    Ok(Broadcast {
        id: EntityId::new().0,
        account_id: account.id.clone(),
        channel_id: channel.id.clone(),
        broadcast_type: request.broadcast_type.clone(),
        message_type: request.message.kind().to_string(),
        content,
        target_count: 0,
        sent_count: 0,
        failed_count: 0,
        status: initial_status.as_str().to_string(),
        created_at: Utc::now(),
        completed_at: None,
    })
}

/// `POST /api/broadcasts/send` -- run inside the request, return
/// final accounting.
async fn send_broadcast(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastRunResponse>, AppError> {
    let channel = resolve_channel(&state, &account, request.channel_id.as_deref()).await?;
    let broadcast = build_broadcast(&account, &channel, &request, BroadcastStatus::Draft)?;
    state.db.insert_broadcast(&broadcast).await?;

    let outcome = state
        .broadcasts
        .run(&channel, &broadcast, request.overrides())
        .await?;

    let row = state
        .db
        .get_broadcast(&broadcast.id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(BroadcastRunResponse::new(row, outcome)))
}

/// `POST /api/broadcasts` -- persist and spawn, return immediately.
async fn create_broadcast(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, AppError> {
    let channel = resolve_channel(&state, &account, request.channel_id.as_deref()).await?;
    let broadcast = build_broadcast(&account, &channel, &request, BroadcastStatus::Scheduled)?;
    state.db.insert_broadcast(&broadcast).await?;

    state
        .broadcasts
        .clone()
        .run_detached(channel, broadcast.clone(), request.overrides());

    Ok(Json(BroadcastResponse { broadcast }))
}

/// `GET /api/broadcasts/:id` -- poll live progress.
async fn get_broadcast(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<BroadcastResponse>, AppError> {
    let broadcast = state
        .db
        .get_broadcast(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    let channel = state
        .db
        .get_channel(&broadcast.channel_id)
        .await?
        .ok_or(AppError::NotFound)?;
    state
        .gate
        .require(&account.id, &channel, Capability::Broadcast)
        .await?;

    Ok(Json(BroadcastResponse { broadcast }))
}

pub fn broadcast_router() -> Router<AppState> {
    Router::new()
        .route("/broadcasts/send", post(send_broadcast))
        .route("/broadcasts", post(create_broadcast))
        .route("/broadcasts/:id", get(get_broadcast))
}
