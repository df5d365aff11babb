//! Outbound message dispatch
//!
//! Translates internal payloads into provider wire messages, performs
//! the send call, and on success persists the outgoing message row,
//! refreshes the conversation preview, and pushes realtime events.

use std::sync::Arc;

use crate::data::{Channel, Conversation, Database, Message, MessagePayload, MessageSource};
use crate::error::AppError;
use crate::line::client::{MessagingApi, wire_messages};
use crate::realtime::{EventType, Notifier, StreamEvent};

/// Outbound message dispatcher
///
/// A reply token is single-use and short-lived, so callers pass one
/// only when dispatching in direct response to an inbound event;
/// everything else goes over push.
#[derive(Clone)]
pub struct OutboundDispatcher {
    api: Arc<dyn MessagingApi>,
    db: Arc<Database>,
    notifier: Arc<Notifier>,
}

impl OutboundDispatcher {
    pub fn new(api: Arc<dyn MessagingApi>, db: Arc<Database>, notifier: Arc<Notifier>) -> Self {
        Self { api, db, notifier }
    }

    /// Send one message into a conversation.
    ///
    /// # Arguments
    /// * `channel` - The sending channel (credentials)
    /// * `conversation` - Target conversation
    /// * `line_user_id` - Remote recipient id, used for push
    /// * `reply_token` - Single-use token from an inbound event, if any
    /// * `payload` - Message content
    /// * `source` - Why this outgoing message exists
    ///
    /// # Errors
    /// Provider rejections surface with the provider's error body; no
    /// message row is persisted for a failed send.
    pub async fn send(
        &self,
        channel: &Channel,
        conversation: &Conversation,
        line_user_id: &str,
        reply_token: Option<&str>,
        payload: MessagePayload,
        source: MessageSource,
    ) -> Result<Message, AppError> {
        let messages = wire_messages(&payload);

        match reply_token {
            Some(token) => {
                self.api
                    .reply(&channel.access_token, token, &messages)
                    .await?
            }
            None => {
                self.api
                    .push(&channel.access_token, line_user_id, &messages)
                    .await?
            }
        }

        self.record_sent(channel, conversation, payload, source).await
    }

    /// Persist an outgoing message that has already reached the
    /// provider and propagate it to dashboards.
    ///
    /// Also the entry point for the bot ingestion path, where the send
    /// happened outside this process and only logging remains.
    pub async fn record_sent(
        &self,
        channel: &Channel,
        conversation: &Conversation,
        payload: MessagePayload,
        source: MessageSource,
    ) -> Result<Message, AppError> {
        let message = Message::outgoing(&conversation.id, source, payload);

        // Insert before the conversation update so a notifier firing
        // off the update always references an existing row.
        self.db.insert_message(&message).await?;
        self.db
            .apply_outbound_conversation_update(
                &conversation.id,
                &message.payload.preview(),
                message.created_at,
            )
            .await?;

        let audience = self.db.get_channel_audience(&channel.id).await?;
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
            conversation_id = %conversation.id,
            message_id = %message.id,
            source = message.source.map(|s| s.as_str()).unwrap_or("none"),
            message_type = message.payload.kind(),
            "Outbound message recorded"
        );

        Ok(message)
    }
}
