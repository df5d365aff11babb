//! Domain services
//!
//! Entity resolution, webhook ingestion, auto-reply matching, and
//! delegated access control on top of the data layer.

pub mod access;
pub mod auto_reply;
pub mod ingest;
pub mod resolver;

pub use access::{AccessGate, GrantFlags, GrantState, effective_state};
pub use auto_reply::find_matching_rule;
pub use ingest::{IngestService, WebhookEnvelope};
pub use resolver::EntityResolver;
