//! Connection registry and event fan-out
//!
//! One `Notifier` exists per process, constructed in `AppState` and
//! passed by handle to every component that publishes. An account may
//! hold several live connections at once (multiple browser tabs); each
//! gets its own unbounded channel.
//!
//! Delivery contract: best effort to currently-open connections only.
//! `publish` cannot fail the caller's operation; a broken connection is
//! skipped and pruned, and there is no backlog or replay for streams
//! that were offline when an event fired (dashboards refetch on
//! reconnect).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Kinds of events pushed to dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NewMessage,
    ConversationUpdate,
    NewConversation,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::ConversationUpdate => "conversation_update",
            Self::NewConversation => "new_conversation",
        }
    }
}

/// One structured frame pushed to a dashboard stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

struct Connection {
    id: u64,
    sender: UnboundedSender<StreamEvent>,
}

/// Per-account registry of live dashboard connections
///
/// The registry is the one piece of shared mutable in-memory state in
/// the process; all access goes through the RwLock.
pub struct Notifier {
    connections: RwLock<HashMap<String, Vec<Connection>>>,
    next_connection_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection for an account.
    ///
    /// Returns a subscription owning the receiving end; dropping it
    /// unregisters the connection.
    pub async fn register(self: &Arc<Self>, account_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let mut connections = self.connections.write().await;
        connections
            .entry(account_id.to_string())
            .or_default()
            .push(Connection { id, sender });

        crate::metrics::SSE_CONNECTIONS_ACTIVE.inc();
        tracing::debug!(account_id, connection_id = id, "Dashboard stream registered");

        Subscription {
            notifier: Arc::clone(self),
            account_id: account_id.to_string(),
            connection_id: id,
            receiver,
        }
    }

    /// Remove one connection of an account.
    pub async fn unregister(&self, account_id: &str, connection_id: u64) {
        let mut connections = self.connections.write().await;
        if let Some(entries) = connections.get_mut(account_id) {
            let before = entries.len();
            entries.retain(|c| c.id != connection_id);
            if entries.len() < before {
                crate::metrics::SSE_CONNECTIONS_ACTIVE.dec();
            }
            if entries.is_empty() {
                connections.remove(account_id);
            }
        }

        tracing::debug!(account_id, connection_id, "Dashboard stream unregistered");
    }

    /// Publish an event to every live connection of one account.
    ///
    /// Write failures mean the receiving stream is gone; the dead
    /// connection is pruned and the remaining connections still get
    /// the event. Never fails.
    pub async fn publish(&self, account_id: &str, event: StreamEvent) {
        crate::metrics::SSE_EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[&event.event_type])
            .inc();

        let mut connections = self.connections.write().await;
        let Some(entries) = connections.get_mut(account_id) else {
            return;
        };

        let before = entries.len();
        entries.retain(|connection| connection.sender.send(event.clone()).is_ok());
        let pruned = before - entries.len();

        if pruned > 0 {
            crate::metrics::SSE_CONNECTIONS_ACTIVE.sub(pruned as i64);
            tracing::debug!(account_id, pruned, "Pruned dead dashboard streams");
        }
        if entries.is_empty() {
            connections.remove(account_id);
        }
    }

    /// Publish an event to every account in an audience list.
    pub async fn publish_to_all(&self, account_ids: &[String], event: StreamEvent) {
        for account_id in account_ids {
            self.publish(account_id, event.clone()).await;
        }
    }

    /// Number of live connections for an account.
    pub async fn connection_count(&self, account_id: &str) -> usize {
        let connections = self.connections.read().await;
        connections.get(account_id).map_or(0, Vec::len)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A live dashboard connection's receiving half
///
/// Unregisters itself from the registry on drop.
pub struct Subscription {
    notifier: Arc<Notifier>,
    account_id: String,
    connection_id: u64,
    pub receiver: UnboundedReceiver<StreamEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let notifier = Arc::clone(&self.notifier);
        let account_id = self.account_id.clone();
        let connection_id = self.connection_id;

        // Drop cannot await; hand the cleanup to the runtime. If the
        // runtime is already gone the registry dies with the process.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                notifier.unregister(&account_id, connection_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_connection_of_the_account() {
        let notifier = Arc::new(Notifier::new());

        let mut first = notifier.register("acct1").await;
        let mut second = notifier.register("acct1").await;
        let mut other = notifier.register("acct2").await;

        notifier
            .publish(
                "acct1",
                StreamEvent::new(EventType::NewMessage, serde_json::json!({"id": "m1"})),
            )
            .await;

        assert_eq!(
            first.receiver.recv().await.unwrap().event_type,
            "new_message"
        );
        assert_eq!(
            second.receiver.recv().await.unwrap().event_type,
            "new_message"
        );
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connection_does_not_block_the_rest() {
        let notifier = Arc::new(Notifier::new());

        let mut first = notifier.register("acct1").await;
        let mut second = notifier.register("acct1").await;

        // Close the first receiver; writes to it now fail.
        first.receiver.close();

        notifier
            .publish(
                "acct1",
                StreamEvent::new(
                    EventType::ConversationUpdate,
                    serde_json::json!({"id": "c1"}),
                ),
            )
            .await;

        let event = second.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, "conversation_update");

        // The dead connection was pruned lazily on the failed write.
        assert_eq!(notifier.connection_count("acct1").await, 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_account_is_a_no_op() {
        let notifier = Arc::new(Notifier::new());
        notifier
            .publish(
                "nobody",
                StreamEvent::new(EventType::NewConversation, serde_json::json!({})),
            )
            .await;
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let notifier = Arc::new(Notifier::new());

        let subscription = notifier.register("acct1").await;
        assert_eq!(notifier.connection_count("acct1").await, 1);

        drop(subscription);
        // Cleanup is spawned; yield so it runs.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(notifier.connection_count("acct1").await, 0);
    }
}
