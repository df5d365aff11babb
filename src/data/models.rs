//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps; every
//! timestamp is UTC so chronological ordering is consistent across
//! writers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Account (dashboard operator)
// =============================================================================

/// A dashboard operator account
///
/// Session/token issuance lives outside this service; only sha256
/// hashes of issued bearer tokens are stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub username: String,
    /// sha256 hash of the dashboard API bearer token
    pub api_token_hash: Option<String>,
    /// sha256 hash of the per-account bot ingestion token
    pub bot_token_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Channel
// =============================================================================

/// A connected LINE Official Account channel
///
/// Owned by exactly one account. Deletion is a status transition,
/// never row removal, so line users / conversations / messages keep
/// their foreign keys across a delete/re-register cycle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: String,
    pub account_id: String,
    /// Remote channel identity at the provider
    pub line_channel_id: String,
    /// Shared secret for webhook signature verification
    pub channel_secret: String,
    /// Long-lived channel access token for outbound calls
    pub access_token: String,
    pub name: String,
    /// active, inactive, deleted
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Channel lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Active,
    Inactive,
    Deleted,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }
}

// =============================================================================
// LineUser
// =============================================================================

/// A chat participant as known to LINE, scoped per channel
///
/// Created lazily on first inbound event. Profile fields are refreshed
/// opportunistically and never destructively cleared on fetch failure.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LineUser {
    pub id: String,
    pub channel_id: String,
    pub line_user_id: String,
    pub display_name: String,
    pub picture_url: Option<String>,
    pub language: Option<String>,
    /// following, blocked, unknown
    pub follow_status: String,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Display name used when the profile fetch fails at creation time.
pub const PLACEHOLDER_DISPLAY_NAME: &str = "Unknown User";

/// Follow status values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowStatus {
    Following,
    Blocked,
    Unknown,
}

impl FollowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Following => "following",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        }
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// The unique thread between a channel and a LINE user
///
/// One row per (channel, line user) pair, enforced by a unique
/// constraint. Holds denormalized preview fields for list rendering.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub channel_id: String,
    /// FK to line_users.id
    pub line_user_id: String,
    /// unread, read, processing, completed, spam
    pub status: String,
    pub unread_count: i64,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation status values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Unread,
    Read,
    Processing,
    Completed,
    Spam,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Spam => "spam",
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// Message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

/// Why an outgoing message exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Manual,
    AutoReply,
    BotReply,
    Broadcast,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoReply => "auto_reply",
            Self::BotReply => "bot_reply",
            Self::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "auto_reply" => Some(Self::AutoReply),
            "bot_reply" => Some(Self::BotReply),
            "broadcast" => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// Message payload as a tagged union
///
/// Exactly one payload shape exists per message by construction; the
/// nullable columns in the messages table are purely a storage
/// concern handled by the database layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    Text {
        content: String,
    },
    /// Media bytes are not fetched synchronously; `media_url` is a
    /// deferred-fetch reference (provider content URL or our own
    /// serving route).
    Image {
        media_url: String,
    },
    Video {
        media_url: String,
    },
    Audio {
        media_url: String,
    },
    File {
        media_url: String,
    },
    Location {
        title: Option<String>,
        address: Option<String>,
        latitude: f64,
        longitude: f64,
    },
    Sticker {
        package_id: String,
        sticker_id: String,
    },
    Template {
        alt_text: String,
        template: serde_json::Value,
    },
    Flex {
        alt_text: String,
        contents: serde_json::Value,
    },
}

impl MessagePayload {
    /// Type tag stored in the message_type column
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Audio { .. } => "audio",
            Self::File { .. } => "file",
            Self::Location { .. } => "location",
            Self::Sticker { .. } => "sticker",
            Self::Template { .. } => "template",
            Self::Flex { .. } => "flex",
        }
    }

    /// Human-readable conversation preview, truncated on a char
    /// boundary at `MAX_PREVIEW_CHARS` for text.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { content } => truncate_preview(content),
            Self::Image { .. } => "[Image]".to_string(),
            Self::Video { .. } => "[Video]".to_string(),
            Self::Audio { .. } => "[Audio]".to_string(),
            Self::File { .. } => "[File]".to_string(),
            Self::Location { .. } => "[Location]".to_string(),
            Self::Sticker { .. } => "[Sticker]".to_string(),
            Self::Template { alt_text, .. } | Self::Flex { alt_text, .. } => {
                truncate_preview(alt_text)
            }
        }
    }

    /// Text content if this is a text payload
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            _ => None,
        }
    }
}

/// Maximum characters kept in a conversation preview.
pub const MAX_PREVIEW_CHARS: usize = 100;

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= MAX_PREVIEW_CHARS {
        text.to_string()
    } else {
        text.chars().take(MAX_PREVIEW_CHARS).collect()
    }
}

/// One row of the append-only message log
///
/// Immutable after creation. `source` is None for incoming messages
/// and records why the message exists for outgoing ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub source: Option<MessageSource>,
    pub payload: MessagePayload,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an incoming message (no source attribution)
    pub fn incoming(conversation_id: &str, payload: MessagePayload) -> Self {
        Self {
            id: EntityId::new().0,
            conversation_id: conversation_id.to_string(),
            direction: Direction::Incoming,
            source: None,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Build an outgoing message with its source attribution
    pub fn outgoing(conversation_id: &str, source: MessageSource, payload: MessagePayload) -> Self {
        Self {
            id: EntityId::new().0,
            conversation_id: conversation_id.to_string(),
            direction: Direction::Outgoing,
            source: Some(source),
            payload,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// AutoReplyRule
// =============================================================================

/// Keyword match strategy for auto-reply rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Contains,
    StartsWith,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::Regex => "regex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "starts_with" => Some(Self::StartsWith),
            "regex" => Some(Self::Regex),
            _ => None,
        }
    }
}

/// A keyword-triggered automatic response definition
///
/// `channel_id` None means the rule applies to every channel owned
/// by the account. Evaluation order is priority descending, id
/// ascending (ULIDs sort by creation time).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutoReplyRule {
    pub id: String,
    pub account_id: String,
    pub channel_id: Option<String>,
    pub keyword: String,
    /// exact, contains, starts_with, regex
    pub match_type: String,
    pub reply_content: String,
    pub is_active: bool,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Broadcast
// =============================================================================

/// Broadcast delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastType {
    /// Single provider call to all followers, against the official quota
    Official,
    /// Explicit recipient list fanned out via multicast batches
    Push,
}

impl BroadcastType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::Push => "push",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "official" => Some(Self::Official),
            "push" => Some(Self::Push),
            _ => None,
        }
    }
}

/// Broadcast lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Sending,
    Completed,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One send campaign
///
/// Counters and status mutate incrementally while a run is in flight
/// and are safely re-readable by a concurrent polling dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Broadcast {
    pub id: String,
    pub account_id: String,
    pub channel_id: String,
    /// official, push
    pub broadcast_type: String,
    pub message_type: String,
    pub content: String,
    pub target_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    /// draft, scheduled, sending, completed, failed
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// AdminPermission (delegation grant)
// =============================================================================

/// A scoped permission relationship between an owner and a delegate
///
/// While pending, the grant has an invite token and expiry but no
/// bound delegate. `channel_id` None means all channels of the owner.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminPermission {
    pub id: String,
    pub owner_account_id: String,
    pub delegate_account_id: Option<String>,
    pub channel_id: Option<String>,
    pub can_reply: bool,
    pub can_view_all: bool,
    pub can_broadcast: bool,
    pub can_manage_channel: bool,
    /// pending, active, revoked
    pub status: String,
    pub invite_token: Option<String>,
    pub invite_expires_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Capabilities a delegation grant can carry
///
/// Flags are independent; no capability implies another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Reply,
    ViewAll,
    Broadcast,
    ManageChannel,
}

impl AdminPermission {
    /// Whether the grant's permission bundle includes a capability
    pub fn grants(&self, capability: Capability) -> bool {
        match capability {
            Capability::Reply => self.can_reply,
            Capability::ViewAll => self.can_view_all,
            Capability::Broadcast => self.can_broadcast,
            Capability::ManageChannel => self.can_manage_channel,
        }
    }
}
