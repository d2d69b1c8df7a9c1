//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the orchestrator and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all orchestrator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total task submissions, labeled by task type and result.
pub static TASKS_SUBMITTED: OnceLock<CounterVec> = OnceLock::new();

/// Submission RPC latency in seconds, labeled by task type.
pub static DISPATCH_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Total remote cancellations, labeled by result.
pub static CANCELLATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Total callback resolutions, labeled by phase and outcome.
pub static CALLBACKS_RESOLVED: OnceLock<CounterVec> = OnceLock::new();

/// Total siblings cancelled because another task of the step failed.
pub static SIBLING_ABORTS: OnceLock<Counter> = OnceLock::new();

/// Total cleanup requests, labeled by result.
pub static CLEANUPS: OnceLock<CounterVec> = OnceLock::new();

/// Total step outcomes, labeled by status.
pub static STEP_OUTCOMES: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again keeps the metrics of the first call.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    static INIT_LOCK: Mutex<()> = Mutex::new(());
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Dispatch metrics
    let tasks_submitted = CounterVec::new(
        Opts::new(
            "orchestrator_tasks_submitted_total",
            "Total task submissions",
        ),
        &["task_type", "result"],
    )?;

    let dispatch_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "orchestrator_dispatch_latency_seconds",
            "Task submission RPC latency in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["task_type"],
    )?;

    let cancellations = CounterVec::new(
        Opts::new(
            "orchestrator_cancellations_total",
            "Total remote task cancellations",
        ),
        &["result"],
    )?;

    // Callback metrics
    let callbacks_resolved = CounterVec::new(
        Opts::new(
            "orchestrator_callbacks_resolved_total",
            "Total callback resolutions",
        ),
        &["phase", "outcome"],
    )?;

    let sibling_aborts = Counter::new(
        "orchestrator_sibling_aborts_total",
        "Total sibling tasks cancelled after another task failed",
    )?;

    // Lifecycle metrics
    let cleanups = CounterVec::new(
        Opts::new("orchestrator_cleanups_total", "Total cleanup requests"),
        &["result"],
    )?;

    let step_outcomes = CounterVec::new(
        Opts::new("orchestrator_step_outcomes_total", "Total step outcomes"),
        &["status"],
    )?;

    registry.register(Box::new(tasks_submitted.clone()))?;
    registry.register(Box::new(dispatch_latency.clone()))?;
    registry.register(Box::new(cancellations.clone()))?;
    registry.register(Box::new(callbacks_resolved.clone()))?;
    registry.register(Box::new(sibling_aborts.clone()))?;
    registry.register(Box::new(cleanups.clone()))?;
    registry.register(Box::new(step_outcomes.clone()))?;

    let _ = TASKS_SUBMITTED.set(tasks_submitted);
    let _ = DISPATCH_LATENCY.set(dispatch_latency);
    let _ = CANCELLATIONS.set(cancellations);
    let _ = CALLBACKS_RESOLVED.set(callbacks_resolved);
    let _ = SIBLING_ABORTS.set(sibling_aborts);
    let _ = CLEANUPS.set(cleanups);
    let _ = STEP_OUTCOMES.set(step_outcomes);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
