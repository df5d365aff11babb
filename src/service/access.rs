//! Delegated access control
//!
//! A channel is always accessible to its owning account. Anyone else
//! needs an active delegation grant from the owner, scoped either to
//! one channel or owner-wide, carrying the required capability flag.
//! Grants move through an explicit pending -> active -> revoked state
//! machine; a pending grant past its invite expiry behaves as absent.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::data::{AdminPermission, Capability, Channel, Database, EntityId};
use crate::error::AppError;

/// How long an invitation stays acceptable.
pub const INVITE_TTL_DAYS: i64 = 7;

/// Grant lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantState {
    Pending,
    Active,
    Revoked,
}

impl GrantState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// The state a grant behaves as at a point in time.
///
/// Returns None when the grant should be treated as absent: revoked,
/// unparseable, or pending with its invitation window closed.
pub fn effective_state(grant: &AdminPermission, now: DateTime<Utc>) -> Option<GrantState> {
    match GrantState::parse(&grant.status)? {
        GrantState::Pending => match grant.invite_expires_at {
            Some(expires_at) if expires_at < now => None,
            _ => Some(GrantState::Pending),
        },
        GrantState::Active => Some(GrantState::Active),
        GrantState::Revoked => None,
    }
}

/// Capability checks and the invitation state machine
#[derive(Clone)]
pub struct AccessGate {
    db: Arc<Database>,
}

/// Capability flags requested for an invitation
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantFlags {
    pub can_reply: bool,
    pub can_view_all: bool,
    pub can_broadcast: bool,
    pub can_manage_channel: bool,
}

impl AccessGate {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Whether an account may perform a capability on a channel.
    pub async fn can_access(
        &self,
        account_id: &str,
        channel: &Channel,
        capability: Capability,
    ) -> Result<bool, AppError> {
        if channel.account_id == account_id {
            return Ok(true);
        }

        let grants = self
            .db
            .get_active_grants_for_channel(&channel.account_id, account_id, &channel.id)
            .await?;

        let now = Utc::now();
        Ok(grants.iter().any(|grant| {
            effective_state(grant, now) == Some(GrantState::Active) && grant.grants(capability)
        }))
    }

    /// `can_access` as a guard, failing with 403.
    pub async fn require(
        &self,
        account_id: &str,
        channel: &Channel,
        capability: Capability,
    ) -> Result<(), AppError> {
        if self.can_access(account_id, channel, capability).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    /// Issue a pending grant and return it with its one-time invite
    /// token. The token is only ever returned here; the row stores it
    /// for lookup and clears it on acceptance.
    pub async fn create_invitation(
        &self,
        owner_account_id: &str,
        channel_id: Option<&str>,
        flags: GrantFlags,
    ) -> Result<(AdminPermission, String), AppError> {
        let token = generate_invite_token();
        let now = Utc::now();

        let permission = AdminPermission {
            id: EntityId::new().0,
            owner_account_id: owner_account_id.to_string(),
            delegate_account_id: None,
            channel_id: channel_id.map(|s| s.to_string()),
            can_reply: flags.can_reply,
            can_view_all: flags.can_view_all,
            can_broadcast: flags.can_broadcast,
            can_manage_channel: flags.can_manage_channel,
            status: "pending".to_string(),
            invite_token: Some(token.clone()),
            invite_expires_at: Some(now + Duration::days(INVITE_TTL_DAYS)),
            accepted_at: None,
            created_at: now,
        };

        self.db.insert_admin_permission(&permission).await?;
        tracing::info!(
            permission_id = %permission.id,
            owner = %owner_account_id,
            channel_id = channel_id.unwrap_or("all"),
            "Issued delegation invitation"
        );

        Ok((permission, token))
    }

    /// Accept an invitation, binding the grant to the accepting
    /// account and activating it.
    ///
    /// An expired invitation is purged and reported gone. An accepting
    /// account that already holds an equivalent active grant gets an
    /// "already a member" rejection and the stale pending row is
    /// purged too. Owners cannot accept their own invitations.
    pub async fn accept_invitation(
        &self,
        token: &str,
        delegate_account_id: &str,
    ) -> Result<AdminPermission, AppError> {
        let pending = self
            .db
            .get_permission_by_invite_token(token)
            .await?
            .ok_or(AppError::NotFound)?;

        let now = Utc::now();
        match effective_state(&pending, now) {
            Some(GrantState::Pending) => {}
            _ => {
                self.db.delete_pending_permission(&pending.id).await?;
                return Err(AppError::Unprocessable(
                    "invitation has expired".to_string(),
                ));
            }
        }

        if pending.owner_account_id == delegate_account_id {
            return Err(AppError::Validation(
                "cannot accept an invitation to your own account".to_string(),
            ));
        }

        let existing = self
            .db
            .get_grants_between(&pending.owner_account_id, delegate_account_id)
            .await?;
        let already_member = existing.iter().any(|grant| {
            effective_state(grant, now) == Some(GrantState::Active)
                && grant.channel_id == pending.channel_id
        });
        if already_member {
            self.db.delete_pending_permission(&pending.id).await?;
            return Err(AppError::Unprocessable(
                "already a member of this workspace".to_string(),
            ));
        }

        self.db
            .activate_permission(&pending.id, delegate_account_id)
            .await?;
        tracing::info!(
            permission_id = %pending.id,
            delegate = %delegate_account_id,
            "Delegation invitation accepted"
        );

        self.db
            .get_permission(&pending.id)
            .await?
            .ok_or(AppError::NotFound)
    }
}

fn generate_invite_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
