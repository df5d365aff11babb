//! Lazy entity resolution
//!
//! Line users and conversations are created on first contact, not
//! provisioned. Concurrent webhook deliveries for the same sender race
//! on creation, so both paths go through conflict-tolerant inserts and
//! converge on the unique (channel, user) constraints.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{
    Channel, Conversation, ConversationStatus, Database, EntityId, FollowStatus, LineUser,
    PLACEHOLDER_DISPLAY_NAME,
};
use crate::error::AppError;
use crate::line::client::MessagingApi;

/// Find-or-create for line users and conversations
#[derive(Clone)]
pub struct EntityResolver {
    db: Arc<Database>,
    api: Arc<dyn MessagingApi>,
}

impl EntityResolver {
    pub fn new(db: Arc<Database>, api: Arc<dyn MessagingApi>) -> Self {
        Self { db, api }
    }

    /// Resolve a remote user id to a stored line user, creating the
    /// row on first contact.
    ///
    /// The profile fetch is best-effort: a provider failure leaves the
    /// placeholder display name in place and never fails resolution.
    pub async fn resolve_user(
        &self,
        channel: &Channel,
        line_user_id: &str,
    ) -> Result<LineUser, AppError> {
        if let Some(user) = self.db.get_line_user(&channel.id, line_user_id).await? {
            self.db.touch_line_user_activity(&user.id).await?;
            if user.display_name == PLACEHOLDER_DISPLAY_NAME {
                return self.refresh_profile(channel, user).await;
            }
            return Ok(user);
        }

        let profile = match self.api.get_profile(&channel.access_token, line_user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    line_user_id = %line_user_id,
                    error = %e,
                    "Profile fetch failed, creating user with placeholder name"
                );
                None
            }
        };

        let now = Utc::now();
        let user = LineUser {
            id: EntityId::new().0,
            channel_id: channel.id.clone(),
            line_user_id: line_user_id.to_string(),
            display_name: profile
                .as_ref()
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| PLACEHOLDER_DISPLAY_NAME.to_string()),
            picture_url: profile.as_ref().and_then(|p| p.picture_url.clone()),
            language: profile.as_ref().and_then(|p| p.language.clone()),
            follow_status: FollowStatus::Following.as_str().to_string(),
            last_active_at: now,
            created_at: now,
        };

        if self.db.insert_line_user_if_absent(&user).await? {
            tracing::info!(
                channel_id = %channel.id,
                line_user_id = %line_user_id,
                "Created line user"
            );
            return Ok(user);
        }

        // Lost the creation race; the winner's row is authoritative.
        self.db
            .get_line_user(&channel.id, line_user_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Retry the profile fetch for a user still carrying the
    /// placeholder name.
    ///
    /// Provider failures keep the stored row as-is; a successful fetch
    /// fills fields in without ever clearing populated ones.
    async fn refresh_profile(
        &self,
        channel: &Channel,
        user: LineUser,
    ) -> Result<LineUser, AppError> {
        let profile = match self
            .api
            .get_profile(&channel.access_token, &user.line_user_id)
            .await
        {
            Ok(Some(profile)) => profile,
            Ok(None) => return Ok(user),
            Err(e) => {
                tracing::debug!(
                    line_user_id = %user.line_user_id,
                    error = %e,
                    "Profile refresh failed, keeping placeholder name"
                );
                return Ok(user);
            }
        };

        self.db
            .refresh_line_user_profile(
                &user.id,
                Some(&profile.display_name),
                profile.picture_url.as_deref(),
                profile.language.as_deref(),
            )
            .await?;
        tracing::info!(
            line_user_id = %user.line_user_id,
            display_name = %profile.display_name,
            "Upgraded placeholder profile"
        );

        self.db
            .get_line_user(&channel.id, &user.line_user_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Resolve the singleton conversation for a (channel, user) pair.
    ///
    /// Returns the conversation and whether this call created it, so
    /// callers can emit a `new_conversation` event exactly once.
    pub async fn resolve_conversation(
        &self,
        channel_id: &str,
        line_user_row_id: &str,
    ) -> Result<(Conversation, bool), AppError> {
        if let Some(conversation) = self
            .db
            .get_conversation_for_user(channel_id, line_user_row_id)
            .await?
        {
            return Ok((conversation, false));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: EntityId::new().0,
            channel_id: channel_id.to_string(),
            line_user_id: line_user_row_id.to_string(),
            status: ConversationStatus::Unread.as_str().to_string(),
            unread_count: 0,
            last_message_preview: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };

        if self
            .db
            .insert_conversation_if_absent(&conversation)
            .await?
        {
            return Ok((conversation, true));
        }

        let existing = self
            .db
            .get_conversation_for_user(channel_id, line_user_row_id)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok((existing, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Account, hash_bearer_token};
    use crate::line::client::UserProfile;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    /// Serves whatever profile it currently holds; `None` misses.
    #[derive(Default)]
    struct ProfileApi {
        profile: Mutex<Option<UserProfile>>,
        fetches: AtomicU64,
    }

    impl ProfileApi {
        fn set_profile(&self, display_name: &str) {
            *self.profile.lock().unwrap() = Some(UserProfile {
                display_name: display_name.to_string(),
                picture_url: Some("https://profile.example.com/a.jpg".to_string()),
                language: Some("ja".to_string()),
            });
        }
    }

    #[async_trait]
    impl MessagingApi for ProfileApi {
        async fn reply(
            &self,
            _access_token: &str,
            _reply_token: &str,
            _messages: &[serde_json::Value],
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn push(
            &self,
            _access_token: &str,
            _to: &str,
            _messages: &[serde_json::Value],
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn multicast(
            &self,
            _access_token: &str,
            _to: &[String],
            _messages: &[serde_json::Value],
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn broadcast(
            &self,
            _access_token: &str,
            _messages: &[serde_json::Value],
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn get_profile(
            &self,
            _access_token: &str,
            _line_user_id: &str,
        ) -> Result<Option<UserProfile>, AppError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            Ok(self.profile.lock().unwrap().clone())
        }
    }

    async fn setup() -> (TempDir, Arc<Database>, Arc<ProfileApi>, EntityResolver, Channel) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp.path().join("test.db"))
                .await
                .unwrap(),
        );

        let now = Utc::now();
        let account = Account {
            id: EntityId::new().0,
            username: "owner".to_string(),
            api_token_hash: Some(hash_bearer_token("api-token")),
            bot_token_hash: None,
            created_at: now,
            updated_at: now,
        };
        db.insert_account(&account).await.unwrap();

        let channel = Channel {
            id: EntityId::new().0,
            account_id: account.id.clone(),
            line_channel_id: "1654000000".to_string(),
            channel_secret: "secret".to_string(),
            access_token: "token".to_string(),
            name: "Support".to_string(),
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        };
        let channel = db.register_channel(&channel).await.unwrap();

        let api = Arc::new(ProfileApi::default());
        let resolver = EntityResolver::new(db.clone(), api.clone());
        (temp, db, api, resolver, channel)
    }

    #[tokio::test]
    async fn placeholder_name_upgrades_once_profile_is_reachable() {
        let (_temp, _db, api, resolver, channel) = setup().await;

        // First contact: the profile lookup misses, so the user lands
        // with the placeholder name.
        let created = resolver.resolve_user(&channel, "U001").await.unwrap();
        assert_eq!(created.display_name, PLACEHOLDER_DISPLAY_NAME);

        api.set_profile("Tanaka");
        let upgraded = resolver.resolve_user(&channel, "U001").await.unwrap();
        assert_eq!(upgraded.id, created.id);
        assert_eq!(upgraded.display_name, "Tanaka");
        assert_eq!(
            upgraded.picture_url.as_deref(),
            Some("https://profile.example.com/a.jpg")
        );
    }

    #[tokio::test]
    async fn resolved_profile_is_not_refetched() {
        let (_temp, _db, api, resolver, channel) = setup().await;
        api.set_profile("Tanaka");

        resolver.resolve_user(&channel, "U001").await.unwrap();
        let fetches_after_create = api.fetches.load(Ordering::Relaxed);

        let again = resolver.resolve_user(&channel, "U001").await.unwrap();
        assert_eq!(again.display_name, "Tanaka");
        assert_eq!(api.fetches.load(Ordering::Relaxed), fetches_after_create);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_placeholder_row() {
        let (_temp, db, _api, resolver, channel) = setup().await;

        let created = resolver.resolve_user(&channel, "U001").await.unwrap();
        assert_eq!(created.display_name, PLACEHOLDER_DISPLAY_NAME);

        // The provider still misses; the second resolve retries and
        // leaves the row untouched.
        let retried = resolver.resolve_user(&channel, "U001").await.unwrap();
        assert_eq!(retried.id, created.id);
        assert_eq!(retried.display_name, PLACEHOLDER_DISPLAY_NAME);

        let stored = db.get_line_user(&channel.id, "U001").await.unwrap().unwrap();
        assert_eq!(stored.display_name, PLACEHOLDER_DISPLAY_NAME);
    }
}
