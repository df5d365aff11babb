//! API request/response shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Broadcast, Channel, Message, MessagePayload};
use crate::error::AppError;
use crate::line::{BroadcastOutcome, RunOverrides};

/// Body for `POST /api/messages/send`
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub message: MessagePayload,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: Message,
}

/// Body for `POST /bot-messages/log/:token`
///
/// External bots speak a flat shape: a `message_type` tag plus the
/// fields that type needs, not the tagged payload enum the dashboard
/// endpoints use.
#[derive(Debug, Deserialize)]
pub struct BotLogRequest {
    pub line_user_id: String,
    /// Defaults to the account's oldest active channel.
    pub channel_id: Option<String>,
    pub message_type: String,
    pub content: Option<String>,
    pub flex_content: Option<serde_json::Value>,
    pub package_id: Option<String>,
    pub sticker_id: Option<String>,
    pub alt_text: Option<String>,
}

impl BotLogRequest {
    /// Assemble the typed payload from the flat bot fields.
    pub fn payload(&self) -> Result<MessagePayload, AppError> {
        match self.message_type.as_str() {
            "text" => {
                let content = self.content.clone().ok_or_else(|| {
                    AppError::Validation("text message requires content".to_string())
                })?;
                Ok(MessagePayload::Text { content })
            }
            "flex" => {
                let contents = self.flex_content.clone().ok_or_else(|| {
                    AppError::Validation("flex message requires flex_content".to_string())
                })?;
                Ok(MessagePayload::Flex {
                    alt_text: self
                        .alt_text
                        .clone()
                        .unwrap_or_else(|| "Flex Message".to_string()),
                    contents,
                })
            }
            "sticker" => {
                let (package_id, sticker_id) = self
                    .package_id
                    .clone()
                    .zip(self.sticker_id.clone())
                    .ok_or_else(|| {
                        AppError::Validation(
                            "sticker message requires package_id and sticker_id".to_string(),
                        )
                    })?;
                Ok(MessagePayload::Sticker {
                    package_id,
                    sticker_id,
                })
            }
            other => Err(AppError::Validation(format!(
                "unsupported bot message type: {other}"
            ))),
        }
    }
}

/// Body for both broadcast endpoints
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    /// Defaults to the account's oldest active channel.
    pub channel_id: Option<String>,
    /// "official" or "push"; defaults to push.
    #[serde(default = "default_broadcast_type")]
    pub broadcast_type: String,
    pub message: MessagePayload,
    /// Caps the push-mode recipient list; ignored for official mode.
    pub limit: Option<usize>,
    /// Overrides the configured inter-batch delay for this run.
    pub delay_ms: Option<u64>,
}

impl BroadcastRequest {
    pub fn overrides(&self) -> RunOverrides {
        RunOverrides {
            limit: self.limit,
            delay_ms: self.delay_ms,
        }
    }
}

fn default_broadcast_type() -> String {
    "push".to_string()
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub broadcast: Broadcast,
}

/// Response of the synchronous send, with final accounting
#[derive(Debug, Serialize)]
pub struct BroadcastRunResponse {
    pub broadcast: Broadcast,
    pub target: i64,
    pub sent: i64,
    pub failed: i64,
}

impl BroadcastRunResponse {
    pub fn new(broadcast: Broadcast, outcome: BroadcastOutcome) -> Self {
        Self {
            broadcast,
            target: outcome.target,
            sent: outcome.sent,
            failed: outcome.failed,
        }
    }
}

/// Body for `POST /api/channels`
#[derive(Debug, Deserialize)]
pub struct RegisterChannelRequest {
    pub line_channel_id: String,
    pub channel_secret: String,
    pub access_token: String,
    pub name: String,
}

/// Channel view without credentials
#[derive(Debug, Serialize)]
pub struct ChannelResponse {
    pub id: String,
    pub line_channel_id: String,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<Channel> for ChannelResponse {
    fn from(channel: Channel) -> Self {
        Self {
            id: channel.id,
            line_channel_id: channel.line_channel_id,
            name: channel.name,
            status: channel.status,
            created_at: channel.created_at,
        }
    }
}

/// Body for `POST /api/permissions/invite`
#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    /// None grants across all of the owner's channels.
    pub channel_id: Option<String>,
    #[serde(default)]
    pub can_reply: bool,
    #[serde(default)]
    pub can_view_all: bool,
    #[serde(default)]
    pub can_broadcast: bool,
    #[serde(default)]
    pub can_manage_channel: bool,
}

/// The invite token is returned exactly once, here.
#[derive(Debug, Serialize)]
pub struct InviteResponse {
    pub permission_id: String,
    pub invite_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Body for `POST /api/permissions/accept`
#[derive(Debug, Deserialize)]
pub struct AcceptInviteRequest {
    pub invite_token: String,
}
