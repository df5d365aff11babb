//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Webhook Metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linedeck_webhook_events_total", "Total number of webhook events processed"),
        &["event_type", "outcome"]
    ).expect("metric can be created");

    // Message Metrics
    pub static ref MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linedeck_messages_total", "Total number of messages persisted"),
        &["direction", "message_type"]
    ).expect("metric can be created");

    // Provider Metrics
    pub static ref PROVIDER_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linedeck_provider_requests_total", "Total number of LINE API calls"),
        &["endpoint", "status"]
    ).expect("metric can be created");
    pub static ref PROVIDER_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "linedeck_provider_request_duration_seconds",
            "LINE API call duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["endpoint"]
    ).expect("metric can be created");

    // Broadcast Metrics
    pub static ref BROADCAST_BATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linedeck_broadcast_batches_total", "Total number of broadcast batches sent"),
        &["outcome"]
    ).expect("metric can be created");

    // Realtime Metrics
    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "linedeck_sse_connections_active",
        "Current number of open dashboard event streams"
    ).expect("metric can be created");
    pub static ref SSE_EVENTS_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linedeck_sse_events_published_total", "Total number of realtime events published"),
        &["event_type"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linedeck_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()))
        .expect("WEBHOOK_EVENTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(MESSAGES_TOTAL.clone()))
        .expect("MESSAGES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(PROVIDER_REQUESTS_TOTAL.clone()))
        .expect("PROVIDER_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(PROVIDER_REQUEST_DURATION_SECONDS.clone()))
        .expect("PROVIDER_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(BROADCAST_BATCHES_TOTAL.clone()))
        .expect("BROADCAST_BATCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SSE_CONNECTIONS_ACTIVE.clone()))
        .expect("SSE_CONNECTIONS_ACTIVE can be registered");
    REGISTRY
        .register(Box::new(SSE_EVENTS_PUBLISHED_TOTAL.clone()))
        .expect("SSE_EVENTS_PUBLISHED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
