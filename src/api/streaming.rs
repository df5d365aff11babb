//! SSE streaming endpoint
//!
//! One stream per authenticated dashboard tab. The connection is
//! registered with the notifier on open and unregistered when the
//! subscription drops with the stream. There is no replay; events
//! published while disconnected are simply missed.

use std::convert::Infallible;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::Stream;

use crate::AppState;
use crate::auth::CurrentUser;
use crate::realtime::Subscription;

fn subscription_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.receiver.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize stream event");
            "{}".to_string()
        });
        let frame = Event::default().event(event.event_type.clone()).data(data);
        Some((Ok(frame), subscription))
    })
}

/// `GET /api/streaming`
async fn stream_events(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!(account_id = %account.id, "SSE stream opened");
    let subscription = state.notifier.register(&account.id).await;
    Sse::new(subscription_stream(subscription)).keep_alive(KeepAlive::default())
}

pub fn streaming_router() -> Router<AppState> {
    Router::new().route("/streaming", get(stream_events))
}
