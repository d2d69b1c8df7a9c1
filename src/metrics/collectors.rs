//! High-level interface for recording orchestrator metrics.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics so the
//! controllers record them with consistent labels. Recording before
//! `init_metrics()` is a no-op.

use super::prometheus::{
    CALLBACKS_RESOLVED, CANCELLATIONS, CLEANUPS, DISPATCH_LATENCY, SIBLING_ABORTS, STEP_OUTCOMES,
    TASKS_SUBMITTED,
};

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Metrics collector for recording orchestrator operational metrics.
///
/// # Example
///
/// ```ignore
/// use infra_orchestrator::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_submission("CI_INIT_INFRA", true, 0.12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one task submission.
    ///
    /// # Arguments
    ///
    /// * `task_type` - Task type tag (e.g., "CI_EXECUTE_STEP")
    /// * `success` - Whether the submission RPC succeeded
    /// * `latency_secs` - Submission RPC latency in seconds
    pub fn record_submission(&self, task_type: &str, success: bool, latency_secs: f64) {
        let result = result_label(success);

        if let Some(tasks_submitted) = TASKS_SUBMITTED.get() {
            tasks_submitted
                .with_label_values(&[task_type, result])
                .inc();
        }

        if let Some(dispatch_latency) = DISPATCH_LATENCY.get() {
            dispatch_latency
                .with_label_values(&[task_type])
                .observe(latency_secs);
        }

        tracing::trace!(
            task_type = task_type,
            result = result,
            latency_secs = latency_secs,
            "Recorded submission metric"
        );
    }

    pub fn record_cancellation(&self, success: bool) {
        if let Some(cancellations) = CANCELLATIONS.get() {
            cancellations
                .with_label_values(&[result_label(success)])
                .inc();
        }
    }

    /// Record a callback resolution.
    ///
    /// # Arguments
    ///
    /// * `phase` - Phase of the resolved handle ("Init", "Execute", "Cleanup")
    /// * `outcome` - Task outcome label ("success", "failure", "cancelled")
    pub fn record_callback(&self, phase: &str, outcome: &str) {
        if let Some(callbacks_resolved) = CALLBACKS_RESOLVED.get() {
            callbacks_resolved
                .with_label_values(&[phase, outcome])
                .inc();
        }

        tracing::trace!(phase = phase, outcome = outcome, "Recorded callback metric");
    }

    /// Record siblings cancelled after another task of the step failed.
    pub fn record_sibling_abort(&self, cancelled: usize) {
        if let Some(sibling_aborts) = SIBLING_ABORTS.get() {
            sibling_aborts.inc_by(cancelled as f64);
        }
    }

    pub fn record_cleanup(&self, success: bool) {
        if let Some(cleanups) = CLEANUPS.get() {
            cleanups.with_label_values(&[result_label(success)]).inc();
        }
    }

    pub fn record_step_outcome(&self, status: &str) {
        if let Some(step_outcomes) = STEP_OUTCOMES.get() {
            step_outcomes.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded step outcome metric");
    }
}
