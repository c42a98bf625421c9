//! Prometheus metrics for the SOP controller
//!
//! - `sop_reconciliations_total{action, result}` - reconcile passes by outcome
//! - `sop_reconciliation_duration_seconds{action}` - reconcile pass latency
//! - `sop_startup_cleanup_deletions_total` - objects removed by startup cleanup

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Shared handle to the controller metrics
pub type SharedMetrics = Arc<ControllerMetrics>;

/// Label used when a SOP has no matching action
pub const UNKNOWN_ACTION: &str = "unknown";

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    cleanup_deletions: IntCounter,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("sop_reconciliations_total", "Total SOP reconciliations"),
            &["action", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "sop_reconciliation_duration_seconds",
                "Duration of SOP reconciliations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["action"],
        )?;
        let cleanup_deletions = IntCounter::new(
            "sop_startup_cleanup_deletions_total",
            "Objects removed by startup cleanup",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(cleanup_deletions.clone()))?;

        Ok(ControllerMetrics {
            registry,
            reconciliations,
            reconcile_duration,
            cleanup_deletions,
        })
    }

    /// Record a finished reconcile pass
    pub fn record_reconciliation(&self, action: &str, result: &str, duration_secs: f64) {
        self.reconciliations
            .with_label_values(&[action, result])
            .inc();
        self.reconcile_duration
            .with_label_values(&[action])
            .observe(duration_secs);
    }

    pub fn record_cleanup_deletions(&self, count: usize) {
        self.cleanup_deletions.inc_by(count as u64);
    }

    /// Current value of `sop_reconciliations_total` for a label pair
    pub fn reconciliation_count(&self, action: &str, result: &str) -> u64 {
        self.reconciliations
            .with_label_values(&[action, result])
            .get()
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
