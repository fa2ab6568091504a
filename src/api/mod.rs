//! API layer
//!
//! HTTP handlers for:
//! - Admin API (backup triggers, history)
//! - Metrics (Prometheus)

mod admin;
pub mod metrics;

pub use admin::{HistoryQuery, TriggerRequest, admin_router};
pub use metrics::metrics_router;
