//! LINE Messaging API integration
//!
//! Webhook signature verification, the outbound HTTP client, direct
//! message dispatch, and broadcast fan-out.

pub mod broadcast;
pub mod client;
pub mod outbound;
pub mod signature;

pub use broadcast::{BroadcastOutcome, BroadcastRunner, RunOverrides, broadcast_payload};
pub use client::{LineClient, MessagingApi, UserProfile, wire, wire_messages};
pub use outbound::OutboundDispatcher;
pub use signature::{SIGNATURE_HEADER, sign_body, verify_signature};
