//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_activities_received_total", "Total number of activities received in inboxes"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_activities_submitted_total", "Total number of activities submitted to outboxes"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref PIPELINE_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_pipeline_runs_total", "Activity pipeline runs"),
        &["chain", "result"]
    ).expect("metric can be created");
    pub static ref REMOTE_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_remote_fetches_total", "Remote entity dereferences"),
        &["result"]
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref QUEUE_JOBS_ENQUEUED: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_queue_jobs_enqueued_total", "Jobs appended to the event queue"),
        &["action"]
    ).expect("metric can be created");
    pub static ref QUEUE_JOBS_EXECUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_queue_jobs_executed_total", "Jobs executed by this process"),
        &["action", "result"]
    ).expect("metric can be created");
    pub static ref QUEUE_CLAIMS_LOST: IntGauge = IntGauge::new(
        "apcore_queue_claims_lost",
        "Job claims lost to another process since start"
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "apcore_delivery_duration_seconds",
            "Outbound delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["action"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("apcore_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_SUBMITTED.clone()))
        .expect("ACTIVITIES_SUBMITTED can be registered");
    REGISTRY
        .register(Box::new(PIPELINE_RUNS_TOTAL.clone()))
        .expect("PIPELINE_RUNS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(REMOTE_FETCHES_TOTAL.clone()))
        .expect("REMOTE_FETCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(QUEUE_JOBS_ENQUEUED.clone()))
        .expect("QUEUE_JOBS_ENQUEUED can be registered");
    REGISTRY
        .register(Box::new(QUEUE_JOBS_EXECUTED.clone()))
        .expect("QUEUE_JOBS_EXECUTED can be registered");
    REGISTRY
        .register(Box::new(QUEUE_CLAIMS_LOST.clone()))
        .expect("QUEUE_CLAIMS_LOST can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
