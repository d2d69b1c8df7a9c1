//! Metrics module for Prometheus-based monitoring.
//!
//! Covers task submission, callback resolution, sibling aborts, cleanups and
//! step outcomes.
//!
//! # Example
//!
//! ```ignore
//! use infra_orchestrator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_cleanup(true);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CALLBACKS_RESOLVED, CANCELLATIONS, CLEANUPS, DISPATCH_LATENCY, REGISTRY, SIBLING_ABORTS,
    STEP_OUTCOMES, TASKS_SUBMITTED,
};
