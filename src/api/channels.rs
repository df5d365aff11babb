//! Channel management endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, post},
};
use chrono::Utc;

use crate::AppState;
use crate::api::dto::{ChannelResponse, RegisterChannelRequest};
use crate::auth::CurrentUser;
use crate::data::{Capability, Channel, ChannelStatus, EntityId};
use crate::error::AppError;

/// `POST /api/channels`
///
/// Registers a channel, or restores it if the same provider channel id
/// was soft-deleted before. Restoration keeps the original row, so
/// conversations and messages recorded before the delete reattach.
async fn register_channel(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Json(request): Json<RegisterChannelRequest>,
) -> Result<Json<ChannelResponse>, AppError> {
    if request.line_channel_id.is_empty() || request.channel_secret.is_empty() {
        return Err(AppError::Validation(
            "line_channel_id and channel_secret are required".to_string(),
        ));
    }

    // Re-registering someone else's channel id must not hijack it.
    if let Some(existing) = state
        .db
        .get_channel_by_line_channel_id(&request.line_channel_id)
        .await?
    {
        if existing.account_id != account.id {
            return Err(AppError::Forbidden);
        }
    }

    let now = Utc::now();
    let channel = Channel {
        id: EntityId::new().0,
        account_id: account.id.clone(),
        line_channel_id: request.line_channel_id,
        channel_secret: request.channel_secret,
        access_token: request.access_token,
        name: request.name,
        status: ChannelStatus::Active.as_str().to_string(),
        created_at: now,
        updated_at: now,
    };

    let stored = state.db.register_channel(&channel).await?;
    tracing::info!(
        channel_id = %stored.id,
        line_channel_id = %stored.line_channel_id,
        "Channel registered"
    );

    Ok(Json(stored.into()))
}

/// `DELETE /api/channels/:id` -- soft delete.
async fn delete_channel(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let channel = state.db.get_channel(&id).await?.ok_or(AppError::NotFound)?;
    state
        .gate
        .require(&account.id, &channel, Capability::ManageChannel)
        .await?;

    state.db.soft_delete_channel(&id).await?;
    tracing::info!(channel_id = %id, "Channel soft-deleted");

    Ok(Json(serde_json::json!({ "success": true })))
}

pub fn channels_router() -> Router<AppState> {
    Router::new()
        .route("/channels", post(register_channel))
        .route("/channels/:id", delete(delete_channel))
}
