//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub messages_received: IntCounter,
    pub events_persisted: IntCounter,
    pub events_rejected: IntCounter,
    /// Labelled by failure kind (duplicate_key, constraint_violation, unavailable, unknown)
    pub events_dropped: IntCounterVec,
    pub probe_attempts: IntCounter,
    pub persist_retries: IntCounter,

    // Gauges
    pub session_state: IntGauge,
    pub in_flight: IntGauge,

    // Histograms
    pub persist_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(Opts::new(
            "news_messages_received_total",
            "Raw messages received from the feed",
        ))?;

        let events_persisted = IntCounter::with_opts(Opts::new(
            "news_events_persisted_total",
            "Events written to the datastore",
        ))?;

        let events_rejected = IntCounter::with_opts(Opts::new(
            "news_events_rejected_total",
            "Messages rejected by validation",
        ))?;

        let events_dropped = IntCounterVec::new(
            Opts::new(
                "news_events_dropped_total",
                "Validated events the datastore did not accept",
            ),
            &["kind"],
        )?;

        let probe_attempts = IntCounter::with_opts(Opts::new(
            "news_probe_attempts_total",
            "Connection probe attempts",
        ))?;

        let persist_retries = IntCounter::with_opts(Opts::new(
            "news_persist_retries_total",
            "Local retries of unavailable datastore writes",
        ))?;

        let session_state = IntGauge::with_opts(Opts::new(
            "news_session_state",
            "Current session state (0=idle .. 5=terminated)",
        ))?;

        let in_flight = IntGauge::with_opts(Opts::new(
            "news_pipeline_in_flight",
            "Events currently inside the validate/persist pipeline",
        ))?;

        let persist_latency = Histogram::with_opts(
            HistogramOpts::new("news_persist_latency_seconds", "Datastore insert latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(events_persisted.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(probe_attempts.clone()))?;
        registry.register(Box::new(persist_retries.clone()))?;
        registry.register(Box::new(session_state.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(persist_latency.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            events_persisted,
            events_rejected,
            events_dropped,
            probe_attempts,
            persist_retries,
            session_state,
            in_flight,
            persist_latency,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
