//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for the pipeline:
//! - Ingestion outcomes, rate-limited and suspicious requests
//! - Raw event processing outcomes, retries and parked events
//! - Staging validation statuses
//! - Promotion outcomes
//! - Orchestrator batch durations
//! - Per-stage backlog gauges

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the pipeline
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Ingestion
    /// Ingestion requests by outcome (accepted, rejected, rate_limited, error)
    pub ingest_requests_total: CounterVec,
    /// Requests rejected by the rate limiter
    pub rate_limited_total: CounterVec,
    /// Requests flagged by the risk scorer
    pub suspicious_requests_total: CounterVec,

    // Processing
    /// Raw events by processing outcome (processed, retried, error)
    pub raw_events_total: CounterVec,
    /// Staging records by validation status
    pub staging_records_total: CounterVec,
    /// Promotions by outcome (promoted, failed, parked)
    pub promotions_total: CounterVec,
    /// Transient failures scheduled for retry
    pub retries_total: CounterVec,
    /// Records taken out of the automatic retry loop
    pub parked_total: CounterVec,

    /// Orchestrator phase duration
    pub batch_duration_seconds: HistogramVec,

    /// Current backlog per stage
    pub backlog: GaugeVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ingest_requests_total = CounterVec::new(
            Opts::new("strata_ingest_requests_total", "Ingestion requests by outcome"),
            &["outcome"],
        )?;

        let rate_limited_total = CounterVec::new(
            Opts::new(
                "strata_rate_limited_total",
                "Requests rejected by the rate limiter",
            ),
            &["endpoint"],
        )?;

        let suspicious_requests_total = CounterVec::new(
            Opts::new(
                "strata_suspicious_requests_total",
                "Requests flagged by the risk scorer",
            ),
            &["endpoint"],
        )?;

        let raw_events_total = CounterVec::new(
            Opts::new(
                "strata_raw_events_total",
                "Raw events by processing outcome",
            ),
            &["outcome"],
        )?;

        let staging_records_total = CounterVec::new(
            Opts::new(
                "strata_staging_records_total",
                "Staging records by validation status",
            ),
            &["validation_status"],
        )?;

        let promotions_total = CounterVec::new(
            Opts::new("strata_promotions_total", "Promotions by outcome"),
            &["outcome"],
        )?;

        let retries_total = CounterVec::new(
            Opts::new(
                "strata_retries_total",
                "Transient failures scheduled for retry",
            ),
            &["stage"],
        )?;

        let parked_total = CounterVec::new(
            Opts::new(
                "strata_parked_total",
                "Records removed from automatic retry",
            ),
            &["stage"],
        )?;

        let batch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "strata_batch_duration_seconds",
                "Orchestrator batch duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["phase"],
        )?;

        let backlog = GaugeVec::new(
            Opts::new("strata_backlog", "Records waiting in each pipeline stage"),
            &["stage"],
        )?;

        registry.register(Box::new(ingest_requests_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(suspicious_requests_total.clone()))?;
        registry.register(Box::new(raw_events_total.clone()))?;
        registry.register(Box::new(staging_records_total.clone()))?;
        registry.register(Box::new(promotions_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(parked_total.clone()))?;
        registry.register(Box::new(batch_duration_seconds.clone()))?;
        registry.register(Box::new(backlog.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            ingest_requests_total,
            rate_limited_total,
            suspicious_requests_total,
            raw_events_total,
            staging_records_total,
            promotions_total,
            retries_total,
            parked_total,
            batch_duration_seconds,
            backlog,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_ingest(&self, outcome: &str) {
        self.ingest_requests_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_rate_limited(&self, endpoint: &str) {
        self.rate_limited_total.with_label_values(&[endpoint]).inc();
    }

    pub fn record_suspicious(&self, endpoint: &str) {
        self.suspicious_requests_total
            .with_label_values(&[endpoint])
            .inc();
    }

    pub fn record_raw_outcome(&self, outcome: &str) {
        self.raw_events_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_staging(&self, validation_status: &str) {
        self.staging_records_total
            .with_label_values(&[validation_status])
            .inc();
    }

    pub fn record_promotion(&self, outcome: &str) {
        self.promotions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_retry(&self, stage: &str) {
        self.retries_total.with_label_values(&[stage]).inc();
    }

    pub fn record_parked(&self, stage: &str) {
        self.parked_total.with_label_values(&[stage]).inc();
    }

    /// Record how long one orchestrator phase took
    pub fn record_batch_duration(&self, phase: &str, duration_secs: f64) {
        self.batch_duration_seconds
            .with_label_values(&[phase])
            .observe(duration_secs);
    }

    /// Publish a backlog snapshot
    pub fn set_backlog(&self, stage: &str, count: u64) {
        self.backlog.with_label_values(&[stage]).set(count as f64);
    }
}
