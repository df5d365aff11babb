//! Realtime dashboard push
//!
//! Maintains the per-account registry of open event streams and fans
//! structured events out to every live connection.

mod notifier;

pub use notifier::{EventType, Notifier, StreamEvent, Subscription};
