// Private module declaration
mod server;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Provides metrics for:
// - Appends (commits per strategy, events, conflicts by kind)
// - Streaming reads (events delivered, poll cycles, fetch latency)
// - Snapshots stored
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

pub struct EventStoreMetrics {
    registry: Registry,

    // Write path
    pub commits_appended: IntCounterVec,
    pub events_appended: IntCounter,
    pub append_conflicts: IntCounterVec,

    // Read path
    pub events_read: IntCounter,
    pub poll_cycles: IntCounter,
    pub fetch_duration: Histogram,

    pub snapshots_stored: IntCounter,
}

impl std::fmt::Debug for EventStoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStoreMetrics")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

impl EventStoreMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let commits_appended = IntCounterVec::new(
            Opts::new("event_store_commits_appended_total", "Commit documents persisted"),
            &["strategy"],
        )?;
        registry.register(Box::new(commits_appended.clone()))?;

        let events_appended = IntCounter::new(
            "event_store_events_appended_total",
            "Events persisted across all commits",
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let append_conflicts = IntCounterVec::new(
            Opts::new("event_store_append_conflicts_total", "Appends rejected by the uniqueness constraint"),
            &["kind"],
        )?;
        registry.register(Box::new(append_conflicts.clone()))?;

        let events_read = IntCounter::new(
            "event_store_events_read_total",
            "Tracked events handed to readers",
        )?;
        registry.register(Box::new(events_read.clone()))?;

        let poll_cycles = IntCounter::new(
            "event_store_poll_cycles_total",
            "Idle poll cycles of follow-mode streams",
        )?;
        registry.register(Box::new(poll_cycles.clone()))?;

        let fetch_duration = Histogram::with_opts(
            HistogramOpts::new("event_store_fetch_duration_seconds", "Tracked event batch fetch duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(fetch_duration.clone()))?;

        let snapshots_stored = IntCounter::new(
            "event_store_snapshots_stored_total",
            "Aggregate snapshots persisted",
        )?;
        registry.register(Box::new(snapshots_stored.clone()))?;

        Ok(Self {
            registry,
            commits_appended,
            events_appended,
            append_conflicts,
            events_read,
            poll_cycles,
            fetch_duration,
            snapshots_stored,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_commit(&self, strategy: &str, event_count: usize) {
        self.commits_appended.with_label_values(&[strategy]).inc();
        self.events_appended.inc_by(event_count as u64);
    }

    pub fn record_conflict(&self, kind: &str) {
        self.append_conflicts.with_label_values(&[kind]).inc();
    }

    pub fn record_fetch(&self, duration_secs: f64) {
        self.fetch_duration.observe(duration_secs);
    }

    /// Count events handed to a reader; fetched but undelivered ones are not.
    pub fn record_delivered(&self, event_count: usize) {
        self.events_read.inc_by(event_count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &EventStoreMetrics, name: &str) -> Option<f64> {
        metrics
            .registry()
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .and_then(|m| m.metric.first().and_then(|metric| metric.counter.value))
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = EventStoreMetrics::new().unwrap();
        metrics.record_commit("document_per_commit", 0);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_commit() {
        let metrics = EventStoreMetrics::new().unwrap();
        metrics.record_commit("document_per_commit", 3);
        metrics.record_commit("document_per_commit", 2);

        assert_eq!(counter_value(&metrics, "event_store_commits_appended_total"), Some(2.0));
        assert_eq!(counter_value(&metrics, "event_store_events_appended_total"), Some(5.0));
    }

    #[test]
    fn test_record_conflicts_by_kind() {
        let metrics = EventStoreMetrics::new().unwrap();
        metrics.record_conflict("append");
        metrics.record_conflict("stream_creation");

        let gathered = metrics.registry().gather();
        let conflicts = gathered
            .iter()
            .find(|m| m.name() == "event_store_append_conflicts_total")
            .unwrap();
        assert_eq!(conflicts.metric.len(), 2); // One series per kind
    }

    #[test]
    fn test_record_fetch_and_delivery() {
        let metrics = EventStoreMetrics::new().unwrap();
        metrics.record_fetch(0.002);
        assert_eq!(metrics.fetch_duration.get_sample_count(), 1);
        assert_eq!(counter_value(&metrics, "event_store_events_read_total"), Some(0.0));

        metrics.record_delivered(3);
        metrics.record_delivered(1);
        assert_eq!(counter_value(&metrics, "event_store_events_read_total"), Some(4.0));
    }
}
