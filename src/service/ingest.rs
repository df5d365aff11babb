//! Inbound webhook event processing
//!
//! Parses provider webhook envelopes, persists inbound messages, keeps
//! conversation rollups current, and triggers keyword auto-replies.
//! Events within one delivery are processed independently; a failing
//! event is logged and skipped, never poisoning its batch.

use std::sync::Arc;

use serde::Deserialize;

use crate::data::{Channel, Database, FollowStatus, Message, MessagePayload, MessageSource};
use crate::error::AppError;
use crate::line::outbound::OutboundDispatcher;
use crate::metrics::WEBHOOK_EVENTS_TOTAL;
use crate::realtime::{EventType, Notifier, StreamEvent};
use crate::service::auto_reply::find_matching_rule;
use crate::service::resolver::EntityResolver;

/// Media content is not mirrored at ingest time; messages store the
/// provider's content endpoint for deferred fetch.
const CONTENT_API_BASE: &str = "https://api-data.line.me/v2/bot/message";

/// Top-level webhook delivery body
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

/// One event within a delivery
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reply_token: Option<String>,
    pub source: Option<EventSource>,
    pub message: Option<EventMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub user_id: Option<String>,
}

/// Provider-shaped message content
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: Option<String>,
    pub title: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub package_id: Option<String>,
    pub sticker_id: Option<String>,
}

impl EventMessage {
    /// Normalize provider message content to an internal payload.
    ///
    /// Returns None for message types this service does not ingest.
    pub fn to_payload(&self) -> Option<MessagePayload> {
        let media_url = || format!("{CONTENT_API_BASE}/{}/content", self.id);
        match self.message_type.as_str() {
            "text" => Some(MessagePayload::Text {
                content: self.text.clone().unwrap_or_default(),
            }),
            "image" => Some(MessagePayload::Image { media_url: media_url() }),
            "video" => Some(MessagePayload::Video { media_url: media_url() }),
            "audio" => Some(MessagePayload::Audio { media_url: media_url() }),
            "file" => Some(MessagePayload::File { media_url: media_url() }),
            "location" => Some(MessagePayload::Location {
                title: self.title.clone(),
                address: self.address.clone(),
                latitude: self.latitude.unwrap_or_default(),
                longitude: self.longitude.unwrap_or_default(),
            }),
            "sticker" => Some(MessagePayload::Sticker {
                package_id: self.package_id.clone().unwrap_or_default(),
                sticker_id: self.sticker_id.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Webhook event pipeline
#[derive(Clone)]
pub struct IngestService {
    db: Arc<Database>,
    resolver: EntityResolver,
    dispatcher: OutboundDispatcher,
    notifier: Arc<Notifier>,
}

impl IngestService {
    pub fn new(
        db: Arc<Database>,
        resolver: EntityResolver,
        dispatcher: OutboundDispatcher,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            resolver,
            dispatcher,
            notifier,
        }
    }

    /// Process every event in a delivery, isolating failures per event.
    pub async fn process_envelope(&self, channel: &Channel, envelope: WebhookEnvelope) {
        for event in envelope.events {
            let event_type = event.event_type.clone();
            match self.process_event(channel, event).await {
                Ok(outcome) => {
                    WEBHOOK_EVENTS_TOTAL
                        .with_label_values(&[&event_type, outcome])
                        .inc();
                }
                Err(e) => {
                    WEBHOOK_EVENTS_TOTAL
                        .with_label_values(&[&event_type, "error"])
                        .inc();
                    tracing::error!(
                        channel_id = %channel.id,
                        event_type = %event_type,
                        error = %e,
                        "Webhook event failed, continuing with remaining events"
                    );
                }
            }
        }
    }

    async fn process_event(
        &self,
        channel: &Channel,
        event: WebhookEvent,
    ) -> Result<&'static str, AppError> {
        let Some(line_user_id) = event.source.as_ref().and_then(|s| s.user_id.clone()) else {
            tracing::debug!(event_type = %event.event_type, "Event without a user source, ignored");
            return Ok("ignored");
        };

        match event.event_type.as_str() {
            "message" => {
                let Some(message) = event.message else {
                    return Ok("ignored");
                };
                let Some(payload) = message.to_payload() else {
                    tracing::debug!(message_type = %message.message_type, "Unsupported message type, ignored");
                    return Ok("ignored");
                };
                self.ingest_message(channel, &line_user_id, event.reply_token.as_deref(), payload)
                    .await?;
                Ok("success")
            }
            "follow" => {
                let user = self.resolver.resolve_user(channel, &line_user_id).await?;
                self.db
                    .update_follow_status(&user.id, FollowStatus::Following)
                    .await?;
                tracing::info!(channel_id = %channel.id, line_user_id = %line_user_id, "User followed");
                Ok("success")
            }
            "unfollow" => {
                // No reply token and no profile access after an
                // unfollow; only flip the status if we know the user.
                if let Some(user) = self.db.get_line_user(&channel.id, &line_user_id).await? {
                    self.db
                        .update_follow_status(&user.id, FollowStatus::Blocked)
                        .await?;
                    tracing::info!(channel_id = %channel.id, line_user_id = %line_user_id, "User unfollowed");
                }
                Ok("success")
            }
            other => {
                tracing::debug!(event_type = %other, "Unhandled event type, ignored");
                Ok("ignored")
            }
        }
    }

    /// Persist one inbound message and fire the auto-reply matcher.
    async fn ingest_message(
        &self,
        channel: &Channel,
        line_user_id: &str,
        reply_token: Option<&str>,
        payload: MessagePayload,
    ) -> Result<(), AppError> {
        let user = self.resolver.resolve_user(channel, line_user_id).await?;
        let (conversation, created) = self
            .resolver
            .resolve_conversation(&channel.id, &user.id)
            .await?;

        let audience = self.db.get_channel_audience(&channel.id).await?;
        if created {
            self.notifier
                .publish_to_all(
                    &audience,
                    StreamEvent::new(
                        EventType::NewConversation,
                        serde_json::json!({ "conversation": conversation, "line_user": user }),
                    ),
                )
                .await;
        }

        let message = Message::incoming(&conversation.id, payload);

        // Insert before the rollup update so readers woken by the
        // conversation change always see the message row.
        self.db.insert_message(&message).await?;
        self.db
            .apply_inbound_conversation_update(
                &conversation.id,
                &message.payload.preview(),
                message.created_at,
            )
            .await?;

        self.notifier
            .publish_to_all(
                &audience,
                StreamEvent::new(
                    EventType::NewMessage,
                    serde_json::json!({
                        "conversation_id": conversation.id,
                        "message": message,
                    }),
                ),
            )
            .await;
        if let Some(updated) = self.db.get_conversation(&conversation.id).await? {
            self.notifier
                .publish_to_all(
                    &audience,
                    StreamEvent::new(
                        EventType::ConversationUpdate,
                        serde_json::json!({ "conversation": updated }),
                    ),
                )
                .await;
        }

        tracing::info!(
            channel_id = %channel.id,
            conversation_id = %conversation.id,
            message_type = message.payload.kind(),
            "Inbound message ingested"
        );

        if let Some(text) = message.payload.text() {
            self.try_auto_reply(channel, &conversation, line_user_id, reply_token, text)
                .await;
        }

        Ok(())
    }

    /// A failed auto-reply never fails the ingestion that triggered it;
    /// the inbound message is already durable at this point.
    async fn try_auto_reply(
        &self,
        channel: &Channel,
        conversation: &crate::data::Conversation,
        line_user_id: &str,
        reply_token: Option<&str>,
        text: &str,
    ) {
        let rules = match self
            .db
            .get_active_rules_for_channel(&channel.account_id, &channel.id)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(channel_id = %channel.id, error = %e, "Failed to load auto-reply rules");
                return;
            }
        };

        let Some(rule) = find_matching_rule(&rules, text) else {
            return;
        };

        let reply = MessagePayload::Text {
            content: rule.reply_content.clone(),
        };
        match self
            .dispatcher
            .send(
                channel,
                conversation,
                line_user_id,
                reply_token,
                reply,
                MessageSource::AutoReply,
            )
            .await
        {
            Ok(_) => {
                tracing::info!(rule_id = %rule.id, conversation_id = %conversation.id, "Auto-reply sent");
            }
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, error = %e, "Auto-reply send failed");
            }
        }
    }
}
