//! Broadcast fan-out
//!
//! Runs one broadcast campaign to completion: resolves the recipient
//! list, splits it into multicast batches, paces the batches, and
//! keeps the broadcast row's counters current so a polling dashboard
//! sees live progress.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BroadcastConfig;
use crate::data::{Broadcast, BroadcastStatus, BroadcastType, Channel, Database, MessagePayload};
use crate::error::AppError;
use crate::line::client::{MessagingApi, wire_messages};
use crate::metrics::BROADCAST_BATCHES_TOTAL;

/// Per-run overrides to the configured fan-out parameters
///
/// Both come from the triggering request; absent fields fall back to
/// `BroadcastConfig`. Official mode ignores the recipient cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    /// Cap on the push-mode recipient list.
    pub limit: Option<usize>,
    /// Inter-batch delay for this run, in milliseconds.
    pub delay_ms: Option<u64>,
}

/// Final accounting for one broadcast run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub target: i64,
    pub sent: i64,
    pub failed: i64,
    pub status: BroadcastStatus,
}

/// Executes broadcast campaigns against the provider
#[derive(Clone)]
pub struct BroadcastRunner {
    api: Arc<dyn MessagingApi>,
    db: Arc<Database>,
    config: BroadcastConfig,
}

impl BroadcastRunner {
    pub fn new(api: Arc<dyn MessagingApi>, db: Arc<Database>, config: BroadcastConfig) -> Self {
        Self { api, db, config }
    }

    /// Run a persisted broadcast to completion, updating its row as
    /// batches land.
    ///
    /// A failed batch is recorded and the run continues; the campaign
    /// ends `failed` only when every attempted recipient failed.
    pub async fn run(
        &self,
        channel: &Channel,
        broadcast: &Broadcast,
        overrides: RunOverrides,
    ) -> Result<BroadcastOutcome, AppError> {
        let payload = broadcast_payload(broadcast)?;

        let outcome = match BroadcastType::parse(&broadcast.broadcast_type) {
            Some(BroadcastType::Official) => self.run_official(channel, broadcast, &payload).await,
            Some(BroadcastType::Push) => {
                self.run_push(channel, broadcast, &payload, overrides).await
            }
            None => Err(AppError::Validation(format!(
                "unknown broadcast type: {}",
                broadcast.broadcast_type
            ))),
        };

        match outcome {
            Ok(outcome) => {
                self.db.finalize_broadcast(&broadcast.id, outcome.status).await?;
                tracing::info!(
                    broadcast_id = %broadcast.id,
                    target = outcome.target,
                    sent = outcome.sent,
                    failed = outcome.failed,
                    status = outcome.status.as_str(),
                    "Broadcast finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                // Setup failures (bad payload, channel gone) never
                // reached the provider, so there is nothing partial to
                // keep. Mark the row failed and surface the error.
                self.db.finalize_broadcast(&broadcast.id, BroadcastStatus::Failed).await?;
                Err(e)
            }
        }
    }

    /// Spawn a broadcast run in the background.
    ///
    /// Progress is observable by polling the broadcast row.
    pub fn run_detached(self: Arc<Self>, channel: Channel, broadcast: Broadcast, overrides: RunOverrides) {
        tokio::spawn(async move {
            if let Err(e) = self.run(&channel, &broadcast, overrides).await {
                tracing::error!(broadcast_id = %broadcast.id, error = %e, "Broadcast run failed");
            }
        });
    }

    /// Official mode: one provider call reaching every follower.
    ///
    /// The provider does not report a delivery count, so the target is
    /// estimated from followers known to this service.
    async fn run_official(
        &self,
        channel: &Channel,
        broadcast: &Broadcast,
        payload: &MessagePayload,
    ) -> Result<BroadcastOutcome, AppError> {
        let target = self.db.count_followed_users(&channel.id).await?;
        self.db.mark_broadcast_sending(&broadcast.id, target).await?;

        let messages = wire_messages(payload);
        match self.api.broadcast(&channel.access_token, &messages).await {
            Ok(()) => {
                BROADCAST_BATCHES_TOTAL.with_label_values(&["success"]).inc();
                self.db.record_broadcast_batch(&broadcast.id, target, 0).await?;
                Ok(BroadcastOutcome {
                    target,
                    sent: target,
                    failed: 0,
                    status: BroadcastStatus::Completed,
                })
            }
            Err(e) => {
                BROADCAST_BATCHES_TOTAL.with_label_values(&["failure"]).inc();
                tracing::warn!(broadcast_id = %broadcast.id, error = %e, "Official broadcast rejected");
                self.db.record_broadcast_batch(&broadcast.id, 0, target).await?;
                Ok(BroadcastOutcome {
                    target,
                    sent: 0,
                    failed: target,
                    status: BroadcastStatus::Failed,
                })
            }
        }
    }

    /// Push mode: multicast to every followed user in creation order,
    /// batched and paced.
    async fn run_push(
        &self,
        channel: &Channel,
        broadcast: &Broadcast,
        payload: &MessagePayload,
        overrides: RunOverrides,
    ) -> Result<BroadcastOutcome, AppError> {
        let recipients = self
            .db
            .get_followable_user_ids(&channel.id, overrides.limit)
            .await?;
        let target = recipients.len() as i64;
        self.db.mark_broadcast_sending(&broadcast.id, target).await?;

        let messages = wire_messages(payload);
        let delay_ms = overrides.delay_ms.unwrap_or(self.config.batch_delay_ms);
        let mut sent = 0i64;
        let mut failed = 0i64;

        for (index, batch) in recipients.chunks(self.config.batch_size).enumerate() {
            if index > 0 && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            match self.api.multicast(&channel.access_token, batch, &messages).await {
                Ok(()) => {
                    BROADCAST_BATCHES_TOTAL.with_label_values(&["success"]).inc();
                    sent += batch.len() as i64;
                    self.db
                        .record_broadcast_batch(&broadcast.id, batch.len() as i64, 0)
                        .await?;
                }
                Err(e) => {
                    BROADCAST_BATCHES_TOTAL.with_label_values(&["failure"]).inc();
                    failed += batch.len() as i64;
                    tracing::warn!(
                        broadcast_id = %broadcast.id,
                        batch = index,
                        batch_size = batch.len(),
                        error = %e,
                        "Multicast batch rejected, continuing"
                    );
                    self.db
                        .record_broadcast_batch(&broadcast.id, 0, batch.len() as i64)
                        .await?;
                }
            }
        }

        let status = if sent == 0 && target > 0 {
            BroadcastStatus::Failed
        } else {
            BroadcastStatus::Completed
        };

        Ok(BroadcastOutcome { target, sent, failed, status })
    }
}

/// Reconstruct the message payload stored on a broadcast row.
///
/// Text broadcasts store the raw text in `content`; every other type
/// stores the full payload as JSON.
pub fn broadcast_payload(broadcast: &Broadcast) -> Result<MessagePayload, AppError> {
    if broadcast.message_type == "text" {
        return Ok(MessagePayload::Text {
            content: broadcast.content.clone(),
        });
    }

    let payload: MessagePayload = serde_json::from_str(&broadcast.content).map_err(|e| {
        AppError::Validation(format!("broadcast {} has malformed content: {e}", broadcast.id))
    })?;

    if payload.kind() != broadcast.message_type {
        return Err(AppError::Validation(format!(
            "broadcast {} content does not match declared type {}",
            broadcast.id, broadcast.message_type
        )));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EntityId, FollowStatus, LineUser};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records provider calls and fails the batch indices it is told to.
    struct StubApi {
        multicast_batches: Mutex<Vec<Vec<String>>>,
        broadcast_calls: Mutex<u64>,
        failing_batches: Vec<usize>,
        fail_broadcast: bool,
    }

    impl StubApi {
        fn succeeding() -> Self {
            Self {
                multicast_batches: Mutex::new(Vec::new()),
                broadcast_calls: Mutex::new(0),
                failing_batches: Vec::new(),
                fail_broadcast: false,
            }
        }

        fn failing_at(batches: Vec<usize>) -> Self {
            Self {
                failing_batches: batches,
                ..Self::succeeding()
            }
        }
    }

    #[async_trait]
    impl MessagingApi for StubApi {
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
            to: &[String],
            _messages: &[serde_json::Value],
        ) -> Result<(), AppError> {
            let mut batches = self.multicast_batches.lock().unwrap();
            let index = batches.len();
            batches.push(to.to_vec());
            if self.failing_batches.contains(&index) {
                return Err(AppError::Provider("multicast rejected".to_string()));
            }
            Ok(())
        }

        async fn broadcast(
            &self,
            _access_token: &str,
            _messages: &[serde_json::Value],
        ) -> Result<(), AppError> {
            *self.broadcast_calls.lock().unwrap() += 1;
            if self.fail_broadcast {
                return Err(AppError::Provider("broadcast rejected".to_string()));
            }
            Ok(())
        }

        async fn get_profile(
            &self,
            _access_token: &str,
            _line_user_id: &str,
        ) -> Result<Option<crate::line::client::UserProfile>, AppError> {
            Ok(None)
        }
    }

    async fn setup(follower_count: usize) -> (TempDir, Arc<Database>, crate::data::Account, Channel) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp.path().join("test.db"))
                .await
                .unwrap(),
        );

        let now = Utc::now();
        let account = crate::data::Account {
            id: EntityId::new().0,
            username: "owner".to_string(),
            api_token_hash: Some(crate::data::hash_bearer_token("api-token")),
            bot_token_hash: Some(crate::data::hash_bearer_token("bot-token")),
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
        db.register_channel(&channel).await.unwrap();

        for i in 0..follower_count {
            let user = LineUser {
                id: EntityId::new().0,
                channel_id: channel.id.clone(),
                line_user_id: format!("U{i:032}"),
                display_name: format!("User {i}"),
                picture_url: None,
                language: None,
                follow_status: FollowStatus::Following.as_str().to_string(),
                last_active_at: now,
                created_at: now + chrono::Duration::milliseconds(i as i64),
            };
            db.insert_line_user_if_absent(&user).await.unwrap();
        }

        (temp, db, account, channel)
    }

    fn push_broadcast(account_id: &str, channel_id: &str) -> Broadcast {
        Broadcast {
            id: EntityId::new().0,
            account_id: account_id.to_string(),
            channel_id: channel_id.to_string(),
            broadcast_type: "push".to_string(),
            message_type: "text".to_string(),
            content: "Spring sale starts today".to_string(),
            target_count: 0,
            sent_count: 0,
            failed_count: 0,
            status: "draft".to_string(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn small_batches() -> BroadcastConfig {
        BroadcastConfig {
            batch_size: 2,
            batch_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn push_broadcast_batches_all_recipients() {
        let (_temp, db, account, channel) = setup(5).await;
        let broadcast = push_broadcast(&account.id, &channel.id);
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::succeeding());
        let runner = BroadcastRunner::new(api.clone(), db.clone(), small_batches());
        let outcome = runner.run(&channel, &broadcast, RunOverrides::default()).await.unwrap();

        assert_eq!(outcome.target, 5);
        assert_eq!(outcome.sent, 5);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.status, BroadcastStatus::Completed);

        // 5 recipients in batches of 2 means 3 calls: 2, 2, 1.
        let batches = api.multicast_batches.lock().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);

        let row = db.get_broadcast(&broadcast.id).await.unwrap().unwrap();
        assert_eq!(row.sent_count, 5);
        assert_eq!(row.status, "completed");
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn recipient_cap_trims_oldest_first() {
        let (_temp, db, account, channel) = setup(5).await;
        let broadcast = push_broadcast(&account.id, &channel.id);
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::succeeding());
        let runner = BroadcastRunner::new(api.clone(), db.clone(), small_batches());
        let overrides = RunOverrides {
            limit: Some(3),
            delay_ms: None,
        };
        let outcome = runner.run(&channel, &broadcast, overrides).await.unwrap();

        assert_eq!(outcome.target, 3);
        assert_eq!(outcome.sent, 3);
        assert_eq!(outcome.status, BroadcastStatus::Completed);

        // Capped runs keep the first-to-follow users.
        let batches = api.multicast_batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        let delivered: Vec<String> = batches.iter().flatten().cloned().collect();
        let expected: Vec<String> = (0..3).map(|i| format!("U{i:032}")).collect();
        assert_eq!(delivered, expected);

        let row = db.get_broadcast(&broadcast.id).await.unwrap().unwrap();
        assert_eq!(row.target_count, 3);
        assert_eq!(row.sent_count, 3);
    }

    #[tokio::test]
    async fn delay_override_replaces_configured_pacing() {
        let (_temp, db, account, channel) = setup(5).await;
        let broadcast = push_broadcast(&account.id, &channel.id);
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::succeeding());
        let runner = BroadcastRunner::new(api.clone(), db.clone(), small_batches());
        let overrides = RunOverrides {
            limit: None,
            delay_ms: Some(150),
        };

        let started = std::time::Instant::now();
        let outcome = runner.run(&channel, &broadcast, overrides).await.unwrap();

        // 3 batches means 2 inter-batch delays at the overridden pace;
        // the configured delay of 0 would not have slept at all.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(outcome.sent, 5);
        assert_eq!(api.multicast_batches.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_the_run() {
        let (_temp, db, account, channel) = setup(6).await;
        let broadcast = push_broadcast(&account.id, &channel.id);
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::failing_at(vec![1]));
        let runner = BroadcastRunner::new(api.clone(), db.clone(), small_batches());
        let outcome = runner.run(&channel, &broadcast, RunOverrides::default()).await.unwrap();

        assert_eq!(outcome.target, 6);
        assert_eq!(outcome.sent, 4);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.sent + outcome.failed, outcome.target);
        assert_eq!(outcome.status, BroadcastStatus::Completed);
        assert_eq!(api.multicast_batches.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn all_batches_failing_marks_broadcast_failed() {
        let (_temp, db, account, channel) = setup(4).await;
        let broadcast = push_broadcast(&account.id, &channel.id);
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::failing_at(vec![0, 1]));
        let runner = BroadcastRunner::new(api, db.clone(), small_batches());
        let outcome = runner.run(&channel, &broadcast, RunOverrides::default()).await.unwrap();

        assert_eq!(outcome.sent, 0);
        assert_eq!(outcome.failed, 4);
        assert_eq!(outcome.status, BroadcastStatus::Failed);

        let row = db.get_broadcast(&broadcast.id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.failed_count, 4);
    }

    #[tokio::test]
    async fn empty_audience_completes_without_provider_calls() {
        let (_temp, db, account, channel) = setup(0).await;
        let broadcast = push_broadcast(&account.id, &channel.id);
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::succeeding());
        let runner = BroadcastRunner::new(api.clone(), db.clone(), small_batches());
        let outcome = runner.run(&channel, &broadcast, RunOverrides::default()).await.unwrap();

        assert_eq!(outcome.target, 0);
        assert_eq!(outcome.status, BroadcastStatus::Completed);
        assert!(api.multicast_batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn official_broadcast_is_a_single_call() {
        let (_temp, db, account, channel) = setup(7).await;
        let mut broadcast = push_broadcast(&account.id, &channel.id);
        broadcast.broadcast_type = "official".to_string();
        db.insert_broadcast(&broadcast).await.unwrap();

        let api = Arc::new(StubApi::succeeding());
        let runner = BroadcastRunner::new(api.clone(), db.clone(), small_batches());
        let outcome = runner.run(&channel, &broadcast, RunOverrides::default()).await.unwrap();

        assert_eq!(*api.broadcast_calls.lock().unwrap(), 1);
        assert!(api.multicast_batches.lock().unwrap().is_empty());
        assert_eq!(outcome.target, 7);
        assert_eq!(outcome.status, BroadcastStatus::Completed);
    }

    #[test]
    fn payload_round_trips_through_broadcast_row() {
        let mut broadcast = push_broadcast("acct", "chan");
        assert_eq!(
            broadcast_payload(&broadcast).unwrap(),
            MessagePayload::Text {
                content: "Spring sale starts today".to_string()
            }
        );

        broadcast.message_type = "image".to_string();
        broadcast.content =
            r#"{"type":"image","media_url":"https://cdn.example.com/sale.jpg"}"#.to_string();
        assert_eq!(
            broadcast_payload(&broadcast).unwrap(),
            MessagePayload::Image {
                media_url: "https://cdn.example.com/sale.jpg".to_string()
            }
        );

        broadcast.message_type = "sticker".to_string();
        assert!(broadcast_payload(&broadcast).is_err());
    }
}
