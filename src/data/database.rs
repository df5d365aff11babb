//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with runtime-bound queries against a migrated schema.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use super::models::*;
use crate::error::AppError;

/// Hash a bearer token for storage/lookup.
///
/// Tokens are never stored in cleartext; both the dashboard API token
/// and the bot ingestion token are matched by sha256 digest.
pub fn hash_bearer_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("sha256:{}", URL_SAFE_NO_PAD.encode(digest))
}

/// Maximum attempts for transient persistence failures.
const DB_RETRY_ATTEMPTS: u32 = 3;
/// Base backoff between retries; multiplied by the attempt number.
const DB_RETRY_BACKOFF: Duration = Duration::from_millis(50);

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

/// Run a database operation with bounded retry on transient failures.
///
/// Exhausting the retries escalates the last error for that single
/// operation; it never takes the process down.
async fn with_retry<T, F, Fut>(operation: &str, mut run: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt < DB_RETRY_ATTEMPTS => {
                tracing::warn!(
                    operation,
                    attempt,
                    %error,
                    "Transient database error, retrying"
                );
                tokio::time::sleep(DB_RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, AppError> {
    let message_type: String = row.try_get("message_type")?;
    let content: Option<String> = row.try_get("content")?;
    let media_url: Option<String> = row.try_get("media_url")?;
    let sticker_package_id: Option<String> = row.try_get("sticker_package_id")?;
    let sticker_id: Option<String> = row.try_get("sticker_id")?;
    let rich_content: Option<String> = row.try_get("rich_content")?;

    let payload = payload_from_columns(
        &message_type,
        content,
        media_url,
        sticker_package_id,
        sticker_id,
        rich_content,
    )?;

    let direction_raw: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction_raw).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown message direction: {direction_raw}"))
    })?;

    let source_raw: Option<String> = row.try_get("source_type")?;
    let source = source_raw.as_deref().and_then(MessageSource::parse);

    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        direction,
        source,
        payload,
        created_at: row.try_get("created_at")?,
    })
}

fn payload_from_columns(
    message_type: &str,
    content: Option<String>,
    media_url: Option<String>,
    sticker_package_id: Option<String>,
    sticker_id: Option<String>,
    rich_content: Option<String>,
) -> Result<MessagePayload, AppError> {
    let missing = |column: &str| {
        AppError::Internal(anyhow::anyhow!(
            "message row of type {message_type} is missing {column}"
        ))
    };

    let payload = match message_type {
        "text" => MessagePayload::Text {
            content: content.ok_or_else(|| missing("content"))?,
        },
        "image" => MessagePayload::Image {
            media_url: media_url.ok_or_else(|| missing("media_url"))?,
        },
        "video" => MessagePayload::Video {
            media_url: media_url.ok_or_else(|| missing("media_url"))?,
        },
        "audio" => MessagePayload::Audio {
            media_url: media_url.ok_or_else(|| missing("media_url"))?,
        },
        "file" => MessagePayload::File {
            media_url: media_url.ok_or_else(|| missing("media_url"))?,
        },
        "location" => {
            let raw = rich_content.ok_or_else(|| missing("rich_content"))?;
            serde_json::from_str(&raw).map_err(|e| {
                AppError::Internal(anyhow::anyhow!("invalid location payload: {e}"))
            })?
        }
        "sticker" => MessagePayload::Sticker {
            package_id: sticker_package_id.ok_or_else(|| missing("sticker_package_id"))?,
            sticker_id: sticker_id.ok_or_else(|| missing("sticker_id"))?,
        },
        "template" => MessagePayload::Template {
            alt_text: content.ok_or_else(|| missing("content"))?,
            template: serde_json::from_str(
                &rich_content.ok_or_else(|| missing("rich_content"))?,
            )
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid template payload: {e}")))?,
        },
        "flex" => MessagePayload::Flex {
            alt_text: content.ok_or_else(|| missing("content"))?,
            contents: serde_json::from_str(
                &rich_content.ok_or_else(|| missing("rich_content"))?,
            )
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid flex payload: {e}")))?,
        },
        other => {
            return Err(AppError::Internal(anyhow::anyhow!(
                "unknown message type: {other}"
            )));
        }
    };

    Ok(payload)
}

/// Split a payload into its storage columns.
///
/// Returns (content, media_url, sticker_package_id, sticker_id, rich_content).
type PayloadColumns = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn payload_to_columns(payload: &MessagePayload) -> PayloadColumns {
    match payload {
        MessagePayload::Text { content } => (Some(content.clone()), None, None, None, None),
        MessagePayload::Image { media_url }
        | MessagePayload::Video { media_url }
        | MessagePayload::Audio { media_url }
        | MessagePayload::File { media_url } => (None, Some(media_url.clone()), None, None, None),
        MessagePayload::Location { .. } => (
            None,
            None,
            None,
            None,
            serde_json::to_string(payload).ok(),
        ),
        MessagePayload::Sticker {
            package_id,
            sticker_id,
        } => (
            None,
            None,
            Some(package_id.clone()),
            Some(sticker_id.clone()),
            None,
        ),
        MessagePayload::Template { alt_text, template } => (
            Some(alt_text.clone()),
            None,
            None,
            None,
            serde_json::to_string(template).ok(),
        ),
        MessagePayload::Flex { alt_text, contents } => (
            Some(alt_text.clone()),
            None,
            None,
            None,
            serde_json::to_string(contents).ok(),
        ),
    }
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub async fn insert_account(&self, account: &Account) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, username, api_token_hash, bot_token_hash, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.api_token_hash)
        .bind(&account.bot_token_hash)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Resolve an account by its dashboard API bearer token.
    pub async fn get_account_by_api_token(&self, token: &str) -> Result<Option<Account>, AppError> {
        let hash = hash_bearer_token(token);
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE api_token_hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        Ok(account)
    }

    /// Resolve an account by its bot ingestion token.
    pub async fn get_account_by_bot_token(&self, token: &str) -> Result<Option<Account>, AppError> {
        let hash = hash_bearer_token(token);
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE bot_token_hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        Ok(account)
    }

    // =========================================================================
    // Channels
    // =========================================================================

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>, AppError> {
        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(channel)
    }

    /// Look up a channel by its remote LINE channel id, any status.
    pub async fn get_channel_by_line_channel_id(
        &self,
        line_channel_id: &str,
    ) -> Result<Option<Channel>, AppError> {
        let channel =
            sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE line_channel_id = ?")
                .bind(line_channel_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(channel)
    }

    /// Register a channel, reviving a soft-deleted row for the same
    /// remote channel id.
    ///
    /// The existing row keeps its primary key, so line users,
    /// conversations, and messages that hang off it are recovered
    /// rather than recreated.
    ///
    /// # Returns
    /// The active channel row after registration.
    pub async fn register_channel(&self, channel: &Channel) -> Result<Channel, AppError> {
        sqlx::query(
            r#"
            INSERT INTO channels (
                id, account_id, line_channel_id, channel_secret, access_token,
                name, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (line_channel_id) DO UPDATE SET
                channel_secret = excluded.channel_secret,
                access_token = excluded.access_token,
                name = excluded.name,
                status = 'active',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.account_id)
        .bind(&channel.line_channel_id)
        .bind(&channel.channel_secret)
        .bind(&channel.access_token)
        .bind(&channel.name)
        .bind(ChannelStatus::Active.as_str())
        .bind(channel.created_at)
        .bind(channel.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_channel_by_line_channel_id(&channel.line_channel_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Soft-delete a channel (status transition, not row removal).
    pub async fn soft_delete_channel(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE channels SET status = 'deleted', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// First active channel of an account, oldest first.
    ///
    /// Used by the bot ingestion path when no channel_id is supplied.
    pub async fn get_default_channel_for_account(
        &self,
        account_id: &str,
    ) -> Result<Option<Channel>, AppError> {
        let channel = sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE account_id = ? AND status = 'active' ORDER BY created_at ASC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(channel)
    }

    // =========================================================================
    // LineUsers
    // =========================================================================

    pub async fn get_line_user(
        &self,
        channel_id: &str,
        line_user_id: &str,
    ) -> Result<Option<LineUser>, AppError> {
        let user = with_retry("get_line_user", || {
            sqlx::query_as::<_, LineUser>(
                "SELECT * FROM line_users WHERE channel_id = ? AND line_user_id = ?",
            )
            .bind(channel_id)
            .bind(line_user_id)
            .fetch_optional(&self.pool)
        })
        .await?;

        Ok(user)
    }

    pub async fn get_line_user_by_id(&self, id: &str) -> Result<Option<LineUser>, AppError> {
        let user = sqlx::query_as::<_, LineUser>("SELECT * FROM line_users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Insert a line user unless the (channel, remote user) pair exists.
    ///
    /// The unique constraint is the correctness backstop for duplicate
    /// webhook deliveries racing each other; a conflicting insert is a
    /// no-op and the caller re-fetches the surviving row.
    ///
    /// # Returns
    /// `true` if inserted, `false` if the pair already existed.
    pub async fn insert_line_user_if_absent(&self, user: &LineUser) -> Result<bool, AppError> {
        let result = with_retry("insert_line_user_if_absent", || {
            sqlx::query(
                r#"
                INSERT INTO line_users (
                    id, channel_id, line_user_id, display_name, picture_url,
                    language, follow_status, last_active_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (channel_id, line_user_id) DO NOTHING
                "#,
            )
            .bind(&user.id)
            .bind(&user.channel_id)
            .bind(&user.line_user_id)
            .bind(&user.display_name)
            .bind(&user.picture_url)
            .bind(&user.language)
            .bind(&user.follow_status)
            .bind(user.last_active_at)
            .bind(user.created_at)
            .execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Opportunistic profile refresh; never clears existing fields.
    pub async fn refresh_line_user_profile(
        &self,
        id: &str,
        display_name: Option<&str>,
        picture_url: Option<&str>,
        language: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE line_users SET
                display_name = COALESCE(?, display_name),
                picture_url = COALESCE(?, picture_url),
                language = COALESCE(?, language)
            WHERE id = ?
            "#,
        )
        .bind(display_name)
        .bind(picture_url)
        .bind(language)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_follow_status(
        &self,
        id: &str,
        status: FollowStatus,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE line_users SET follow_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn touch_line_user_activity(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE line_users SET last_active_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remote user ids of followable users for a channel, oldest first.
    ///
    /// First-to-follow is served first so a capped or interrupted
    /// broadcast run is deterministic and fair.
    pub async fn get_followable_user_ids(
        &self,
        channel_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>, AppError> {
        let rows = match limit {
            Some(limit) => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT line_user_id FROM line_users
                    WHERE channel_id = ? AND follow_status = 'following'
                    ORDER BY created_at ASC
                    LIMIT ?
                    "#,
                )
                .bind(channel_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT line_user_id FROM line_users
                    WHERE channel_id = ? AND follow_status = 'following'
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(channel_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    pub async fn count_followed_users(&self, channel_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM line_users WHERE channel_id = ? AND follow_status = 'following'",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(conversation)
    }

    pub async fn get_conversation_for_user(
        &self,
        channel_id: &str,
        line_user_row_id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        let conversation = with_retry("get_conversation_for_user", || {
            sqlx::query_as::<_, Conversation>(
                "SELECT * FROM conversations WHERE channel_id = ? AND line_user_id = ?",
            )
            .bind(channel_id)
            .bind(line_user_row_id)
            .fetch_optional(&self.pool)
        })
        .await?;

        Ok(conversation)
    }

    /// Insert a conversation unless one exists for the pair.
    ///
    /// Same race discipline as `insert_line_user_if_absent`.
    pub async fn insert_conversation_if_absent(
        &self,
        conversation: &Conversation,
    ) -> Result<bool, AppError> {
        let result = with_retry("insert_conversation_if_absent", || {
            sqlx::query(
                r#"
                INSERT INTO conversations (
                    id, channel_id, line_user_id, status, unread_count,
                    last_message_preview, last_message_at, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (channel_id, line_user_id) DO NOTHING
                "#,
            )
            .bind(&conversation.id)
            .bind(&conversation.channel_id)
            .bind(&conversation.line_user_id)
            .bind(&conversation.status)
            .bind(conversation.unread_count)
            .bind(&conversation.last_message_preview)
            .bind(conversation.last_message_at)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Apply the inbound-message conversation update: force status to
    /// unread, bump unread_count by exactly one, refresh the preview.
    pub async fn apply_inbound_conversation_update(
        &self,
        id: &str,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        with_retry("apply_inbound_conversation_update", || {
            sqlx::query(
                r#"
                UPDATE conversations SET
                    status = 'unread',
                    unread_count = unread_count + 1,
                    last_message_preview = ?,
                    last_message_at = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(preview)
            .bind(at)
            .bind(at)
            .bind(id)
            .execute(&self.pool)
        })
        .await?;

        Ok(())
    }

    /// Apply the outbound-send conversation update: preview and
    /// timestamp only; unread_count and status are left alone.
    pub async fn apply_outbound_conversation_update(
        &self,
        id: &str,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE conversations SET
                last_message_preview = ?,
                last_message_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(preview)
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub async fn insert_message(&self, message: &Message) -> Result<(), AppError> {
        let (content, media_url, sticker_package_id, sticker_id, rich_content) =
            payload_to_columns(&message.payload);

        with_retry("insert_message", || {
            sqlx::query(
                r#"
                INSERT INTO messages (
                    id, conversation_id, direction, message_type, content,
                    media_url, sticker_package_id, sticker_id, rich_content,
                    source_type, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(&message.conversation_id)
            .bind(message.direction.as_str())
            .bind(message.payload.kind())
            .bind(&content)
            .bind(&media_url)
            .bind(&sticker_package_id)
            .bind(&sticker_id)
            .bind(&rich_content)
            .bind(message.source.map(|s| s.as_str()))
            .bind(message.created_at)
            .execute(&self.pool)
        })
        .await?;

        crate::metrics::MESSAGES_TOTAL
            .with_label_values(&[message.direction.as_str(), message.payload.kind()])
            .inc();

        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, AppError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    /// Messages of a conversation in chronological order.
    pub async fn get_messages_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    // =========================================================================
    // Auto-reply rules
    // =========================================================================

    pub async fn insert_auto_reply_rule(&self, rule: &AutoReplyRule) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO auto_reply_rules (
                id, account_id, channel_id, keyword, match_type,
                reply_content, is_active, priority, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.account_id)
        .bind(&rule.channel_id)
        .bind(&rule.keyword)
        .bind(&rule.match_type)
        .bind(&rule.reply_content)
        .bind(rule.is_active)
        .bind(rule.priority)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Active rules applicable to a channel (channel-scoped or global
    /// for the owning account), pre-sorted for first-match-wins
    /// evaluation: priority descending, id ascending.
    pub async fn get_active_rules_for_channel(
        &self,
        account_id: &str,
        channel_id: &str,
    ) -> Result<Vec<AutoReplyRule>, AppError> {
        let rules = sqlx::query_as::<_, AutoReplyRule>(
            r#"
            SELECT * FROM auto_reply_rules
            WHERE account_id = ? AND is_active = 1
              AND (channel_id IS NULL OR channel_id = ?)
            ORDER BY priority DESC, id ASC
            "#,
        )
        .bind(account_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    // =========================================================================
    // Broadcasts
    // =========================================================================

    pub async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO broadcasts (
                id, account_id, channel_id, broadcast_type, message_type, content,
                target_count, sent_count, failed_count, status, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&broadcast.id)
        .bind(&broadcast.account_id)
        .bind(&broadcast.channel_id)
        .bind(&broadcast.broadcast_type)
        .bind(&broadcast.message_type)
        .bind(&broadcast.content)
        .bind(broadcast.target_count)
        .bind(broadcast.sent_count)
        .bind(broadcast.failed_count)
        .bind(&broadcast.status)
        .bind(broadcast.created_at)
        .bind(broadcast.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_broadcast(&self, id: &str) -> Result<Option<Broadcast>, AppError> {
        let broadcast = sqlx::query_as::<_, Broadcast>("SELECT * FROM broadcasts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(broadcast)
    }

    pub async fn mark_broadcast_sending(
        &self,
        id: &str,
        target_count: i64,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE broadcasts SET status = 'sending', target_count = ? WHERE id = ?")
            .bind(target_count)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record one batch outcome. Counters only ever grow, so a
    /// concurrent progress poll observes monotonic values.
    pub async fn record_broadcast_batch(
        &self,
        id: &str,
        sent_delta: i64,
        failed_delta: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE broadcasts SET sent_count = sent_count + ?, failed_count = failed_count + ? WHERE id = ?",
        )
        .bind(sent_delta)
        .bind(failed_delta)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn finalize_broadcast(
        &self,
        id: &str,
        status: BroadcastStatus,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE broadcasts SET status = ?, completed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Admin permissions
    // =========================================================================

    pub async fn insert_admin_permission(
        &self,
        permission: &AdminPermission,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO admin_permissions (
                id, owner_account_id, delegate_account_id, channel_id,
                can_reply, can_view_all, can_broadcast, can_manage_channel,
                status, invite_token, invite_expires_at, accepted_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&permission.id)
        .bind(&permission.owner_account_id)
        .bind(&permission.delegate_account_id)
        .bind(&permission.channel_id)
        .bind(permission.can_reply)
        .bind(permission.can_view_all)
        .bind(permission.can_broadcast)
        .bind(permission.can_manage_channel)
        .bind(&permission.status)
        .bind(&permission.invite_token)
        .bind(permission.invite_expires_at)
        .bind(permission.accepted_at)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_permission(&self, id: &str) -> Result<Option<AdminPermission>, AppError> {
        let permission =
            sqlx::query_as::<_, AdminPermission>("SELECT * FROM admin_permissions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(permission)
    }

    pub async fn get_permission_by_invite_token(
        &self,
        token: &str,
    ) -> Result<Option<AdminPermission>, AppError> {
        let permission = sqlx::query_as::<_, AdminPermission>(
            "SELECT * FROM admin_permissions WHERE invite_token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(permission)
    }

    /// Grants (any status) from an owner to a delegate.
    pub async fn get_grants_between(
        &self,
        owner_account_id: &str,
        delegate_account_id: &str,
    ) -> Result<Vec<AdminPermission>, AppError> {
        let grants = sqlx::query_as::<_, AdminPermission>(
            "SELECT * FROM admin_permissions WHERE owner_account_id = ? AND delegate_account_id = ?",
        )
        .bind(owner_account_id)
        .bind(delegate_account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(grants)
    }

    /// Active grants from an owner to a delegate scoped to a channel
    /// or owner-wide.
    pub async fn get_active_grants_for_channel(
        &self,
        owner_account_id: &str,
        delegate_account_id: &str,
        channel_id: &str,
    ) -> Result<Vec<AdminPermission>, AppError> {
        let grants = sqlx::query_as::<_, AdminPermission>(
            r#"
            SELECT * FROM admin_permissions
            WHERE owner_account_id = ? AND delegate_account_id = ?
              AND status = 'active'
              AND (channel_id IS NULL OR channel_id = ?)
            "#,
        )
        .bind(owner_account_id)
        .bind(delegate_account_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(grants)
    }

    /// Bind a delegate to a pending grant: token cleared, acceptance
    /// timestamp set, status flipped to active.
    pub async fn activate_permission(
        &self,
        id: &str,
        delegate_account_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE admin_permissions SET
                delegate_account_id = ?,
                status = 'active',
                invite_token = NULL,
                invite_expires_at = NULL,
                accepted_at = ?
            WHERE id = ?
            "#,
        )
        .bind(delegate_account_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Purge a stale pending grant row.
    pub async fn delete_pending_permission(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM admin_permissions WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn revoke_permission(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE admin_permissions SET status = 'revoked' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Account ids that should receive realtime events for a channel:
    /// the owner plus delegates holding an active grant that either
    /// covers all channels with view access or is scoped to this one.
    pub async fn get_channel_audience(&self, channel_id: &str) -> Result<Vec<String>, AppError> {
        let channel = match self.get_channel(channel_id).await? {
            Some(channel) => channel,
            None => return Ok(Vec::new()),
        };

        let mut audience = vec![channel.account_id.clone()];

        let delegates = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT delegate_account_id FROM admin_permissions
            WHERE owner_account_id = ? AND status = 'active'
              AND delegate_account_id IS NOT NULL
              AND ((channel_id IS NULL AND can_view_all = 1) OR channel_id = ?)
            "#,
        )
        .bind(&channel.account_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        for delegate in delegates {
            if !audience.contains(&delegate) {
                audience.push(delegate);
            }
        }

        Ok(audience)
    }
}
