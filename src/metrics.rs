//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Counter, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Backup run metrics
    pub static ref BACKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("marketvault_backups_total", "Total number of backup runs"),
        &["job", "status"]
    ).expect("metric can be created");
    pub static ref BACKUP_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "marketvault_backup_duration_seconds",
            "Backup run duration in seconds"
        ).buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["job"]
    ).expect("metric can be created");

    // Object storage metrics
    pub static ref OBJECT_PUTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("marketvault_object_puts_total", "Total number of signed object PUTs"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref OBJECT_PUT_BYTES: Counter = Counter::new(
        "marketvault_object_put_bytes_total",
        "Total bytes uploaded to backup destinations"
    ).expect("metric can be created");

    // Side effects
    pub static ref NOTIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("marketvault_notifications_total", "Total number of operator notifications"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref HISTORY_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("marketvault_history_writes_total", "Total number of backup history inserts"),
        &["outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("marketvault_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(BACKUPS_TOTAL.clone()))
        .expect("BACKUPS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(BACKUP_DURATION_SECONDS.clone()))
        .expect("BACKUP_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(OBJECT_PUTS_TOTAL.clone()))
        .expect("OBJECT_PUTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(OBJECT_PUT_BYTES.clone()))
        .expect("OBJECT_PUT_BYTES can be registered");
    REGISTRY
        .register(Box::new(NOTIFICATIONS_TOTAL.clone()))
        .expect("NOTIFICATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(HISTORY_WRITES_TOTAL.clone()))
        .expect("HISTORY_WRITES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
