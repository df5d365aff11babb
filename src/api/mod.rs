//! API layer
//!
//! HTTP handlers for:
//! - Provider webhook + bot message logging (signature/token auth)
//! - Dashboard API (bearer-token auth)
//! - SSE streaming
//! - Metrics (Prometheus)

mod broadcast;
mod channels;
mod dto;
mod messages;
pub mod metrics;
mod permissions;
mod streaming;
mod webhook;

pub use dto::*;

pub use broadcast::broadcast_router;
pub use channels::channels_router;
pub use messages::messages_router;
pub use metrics::metrics_router;
pub use permissions::permissions_router;
pub use streaming::streaming_router;
pub use webhook::webhook_router;
