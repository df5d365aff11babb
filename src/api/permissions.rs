//! Delegation endpoints
//!
//! Owners issue invitations carrying a capability bundle; another
//! account redeems the one-time token to activate the grant.

use axum::{Json, Router, extract::State, routing::post};

use crate::AppState;
use crate::api::dto::{AcceptInviteRequest, InviteRequest, InviteResponse};
use crate::auth::CurrentUser;
use crate::data::AdminPermission;
use crate::error::AppError;
use crate::service::GrantFlags;

/// `POST /api/permissions/invite`
async fn invite(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Json(request): Json<InviteRequest>,
) -> Result<Json<InviteResponse>, AppError> {
    // A channel-scoped invitation must point at a channel the issuer
    // actually owns.
    if let Some(channel_id) = &request.channel_id {
        let channel = state
            .db
            .get_channel(channel_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if channel.account_id != account.id {
            return Err(AppError::Forbidden);
        }
    }

    let flags = GrantFlags {
        can_reply: request.can_reply,
        can_view_all: request.can_view_all,
        can_broadcast: request.can_broadcast,
        can_manage_channel: request.can_manage_channel,
    };
    let (permission, token) = state
        .gate
        .create_invitation(&account.id, request.channel_id.as_deref(), flags)
        .await?;

    Ok(Json(InviteResponse {
        permission_id: permission.id,
        invite_token: token,
        expires_at: permission.invite_expires_at,
    }))
}

/// `POST /api/permissions/accept`
async fn accept(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Json(request): Json<AcceptInviteRequest>,
) -> Result<Json<AdminPermission>, AppError> {
    let permission = state
        .gate
        .accept_invitation(&request.invite_token, &account.id)
        .await?;
    Ok(Json(permission))
}

pub fn permissions_router() -> Router<AppState> {
    Router::new()
        .route("/permissions/invite", post(invite))
        .route("/permissions/accept", post(accept))
}
