//! Prometheus metrics for the runtime.
//!
//! Metrics live in their own registry so repeated runtime instances
//! (tests, embedding) never collide on global registration. The host
//! process decides how to export the gathered families; the runtime only
//! records.

use std::sync::Arc;

use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
};

/// Runtime-level metrics.
#[derive(Clone)]
pub struct RuntimeMetrics {
    registry: Registry,
    /// Completed inferences by status (success, failure,
    /// failed_before_dispatch).
    inferences_total: Arc<CounterVec>,
    /// End-to-end inference duration in seconds.
    inference_duration_seconds: Arc<HistogramVec>,
    /// Admission rejections by classified reason.
    rejections_total: Arc<CounterVec>,
    /// In-flight inferences.
    in_flight: Arc<Gauge>,
    /// Versions currently READY.
    ready_versions: Arc<IntGauge>,
}

impl RuntimeMetrics {
    /// Create and register all metric families.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let inferences_total = CounterVec::new(
            Opts::new("infermux_inferences_total", "Completed inferences"),
            &["status"],
        )?;
        registry.register(Box::new(inferences_total.clone()))?;

        let inference_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "infermux_inference_duration_seconds",
                "End-to-end inference duration in seconds",
            )
            .buckets(vec![0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0]),
            &["status"],
        )?;
        registry.register(Box::new(inference_duration_seconds.clone()))?;

        let rejections_total = CounterVec::new(
            Opts::new("infermux_rejections_total", "Admission rejections"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let in_flight = Gauge::with_opts(Opts::new(
            "infermux_inferences_in_flight",
            "Inferences currently executing",
        ))?;
        registry.register(Box::new(in_flight.clone()))?;

        let ready_versions = IntGauge::with_opts(Opts::new(
            "infermux_ready_versions",
            "Model versions currently READY",
        ))?;
        registry.register(Box::new(ready_versions.clone()))?;

        Ok(Self {
            registry,
            inferences_total: Arc::new(inferences_total),
            inference_duration_seconds: Arc::new(inference_duration_seconds),
            rejections_total: Arc::new(rejections_total),
            in_flight: Arc::new(in_flight),
            ready_versions: Arc::new(ready_versions),
        })
    }

    /// Record one finished inference.
    pub fn record_inference(&self, status: &str, duration_ms: u64) {
        self.inferences_total.with_label_values(&[status]).inc();
        self.inference_duration_seconds
            .with_label_values(&[status])
            .observe(duration_ms as f64 / 1000.0);
    }

    /// Record an admission rejection.
    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    pub fn set_in_flight(&self, count: u32) {
        self.in_flight.set(f64::from(count));
    }

    pub fn set_ready_versions(&self, count: i64) {
        self.ready_versions.set(count);
    }

    /// Gather all families for export.
    #[must_use]
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
