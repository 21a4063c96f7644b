//! Metrics.
//!
//! Metric namespaces:
//! - liaison.grpc.total_stream_* (per service and method)
//! - liaison.grpc.total_stream_msg_* (per group, service and method)
//! - liaison.grpc.total_* (unary calls, per group, service and method)
//!
//! Series are keyed by metric name plus an ordered label set and exported in
//! Prometheus text format.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod metrics {
    /// Write streams opened.
    pub const STREAM_STARTED: &str = "liaison.grpc.total_stream_started";
    /// Write streams closed, on any exit path.
    pub const STREAM_FINISHED: &str = "liaison.grpc.total_stream_finished";
    /// Stream lifetime in seconds.
    pub const STREAM_LATENCY: &str = "liaison.grpc.total_stream_latency";
    /// Messages received on a stream.
    pub const STREAM_MSG_RECEIVED: &str = "liaison.grpc.total_stream_msg_received";
    /// Messages answered with a failure status.
    pub const STREAM_MSG_RECEIVED_ERR: &str = "liaison.grpc.total_stream_msg_received_err";
    /// Replies that could not be delivered to the client.
    pub const STREAM_MSG_SENT_ERR: &str = "liaison.grpc.total_stream_msg_sent_err";
    /// Unary calls started.
    pub const STARTED: &str = "liaison.grpc.total_started";
    /// Unary calls finished.
    pub const FINISHED: &str = "liaison.grpc.total_finished";
    /// Unary calls that failed.
    pub const ERR: &str = "liaison.grpc.total_err";
    /// Unary call latency in seconds.
    pub const LATENCY: &str = "liaison.grpc.total_latency";
}

/// Name plus rendered label set, e.g. `("a.b", r#"group="sw",method="write""#)`.
type SeriesKey = (String, String);

fn series_key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let rendered = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    (name.to_string(), rendered)
}

fn render_series(name: &str, labels: &str, suffix: &str) -> String {
    if labels.is_empty() {
        format!("{}{}", name, suffix)
    } else {
        format!("{}{}{{{}}}", name, suffix, labels)
    }
}

/// Labelled metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<SeriesKey, AtomicU64>>,
    histograms: RwLock<BTreeMap<SeriesKey, Mutex<HistogramData>>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add(name, labels, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let key = series_key(name, labels);
        let counters = self.counters.read();
        if let Some(counter) = counters.get(&key) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        drop(counters);

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Get counter value.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&series_key(name, labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(name, labels);
        let histograms = self.histograms.read();
        if let Some(data) = histograms.get(&key) {
            data.lock().observe(value);
            return;
        }
        drop(histograms);

        self.histograms
            .write()
            .entry(key)
            .or_insert_with(|| Mutex::new(HistogramData::new()))
            .lock()
            .observe(value);
    }

    /// Get histogram data.
    pub fn histogram_get(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        self.histograms
            .read()
            .get(&series_key(name, labels))
            .map(|h| h.lock().snapshot())
    }

    /// Export metrics in Prometheus format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let mut last = String::new();
        for ((name, labels), value) in self.counters.read().iter() {
            let prometheus_name = name.replace('.', "_");
            if prometheus_name != last {
                output.push_str(&format!("# TYPE {} counter\n", prometheus_name));
                last = prometheus_name.clone();
            }
            output.push_str(&format!(
                "{} {}\n",
                render_series(&prometheus_name, labels, ""),
                value.load(Ordering::Relaxed)
            ));
        }

        last.clear();
        for ((name, labels), data) in self.histograms.read().iter() {
            let prometheus_name = name.replace('.', "_");
            if prometheus_name != last {
                output.push_str(&format!("# TYPE {} histogram\n", prometheus_name));
                last = prometheus_name.clone();
            }
            let snapshot = data.lock().snapshot();
            output.push_str(&format!(
                "{} {}\n{} {}\n",
                render_series(&prometheus_name, labels, "_count"),
                snapshot.count,
                render_series(&prometheus_name, labels, "_sum"),
                snapshot.sum
            ));
        }

        output
    }
}

/// Histogram data storage.
#[derive(Debug)]
struct HistogramData {
    count: u64,
    sum: f64,
}

impl HistogramData {
    fn new() -> Self {
        Self { count: 0, sum: 0.0 }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
}

/// RPC identity used as the `service` and `method` labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcLabels {
    pub service: &'static str,
    pub method: &'static str,
}

impl RpcLabels {
    pub const STREAM_WRITE: Self = Self {
        service: "stream",
        method: "write",
    };
    pub const STREAM_QUERY: Self = Self {
        service: "stream",
        method: "query",
    };
}

/// Liaison-specific metrics collector.
#[derive(Debug, Default)]
pub struct LiaisonMetrics {
    registry: MetricsRegistry,
}

impl LiaisonMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    // === Streams ===

    pub fn stream_started(&self, rpc: RpcLabels) {
        self.registry.counter_inc(
            metrics::STREAM_STARTED,
            &[("service", rpc.service), ("method", rpc.method)],
        );
    }

    pub fn stream_finished(&self, rpc: RpcLabels, latency_secs: f64) {
        let labels = [("service", rpc.service), ("method", rpc.method)];
        self.registry.counter_inc(metrics::STREAM_FINISHED, &labels);
        self.registry
            .histogram_observe(metrics::STREAM_LATENCY, &labels, latency_secs);
    }

    pub fn msg_received(&self, group: &str, rpc: RpcLabels) {
        self.registry.counter_inc(
            metrics::STREAM_MSG_RECEIVED,
            &[("group", group), ("service", rpc.service), ("method", rpc.method)],
        );
    }

    pub fn msg_received_err(&self, group: &str, rpc: RpcLabels) {
        self.registry.counter_inc(
            metrics::STREAM_MSG_RECEIVED_ERR,
            &[("group", group), ("service", rpc.service), ("method", rpc.method)],
        );
    }

    pub fn msg_sent_err(&self, group: &str, rpc: RpcLabels) {
        self.registry.counter_inc(
            metrics::STREAM_MSG_SENT_ERR,
            &[("group", group), ("service", rpc.service), ("method", rpc.method)],
        );
    }

    // === Unary calls ===

    pub fn call_started(&self, group: &str, rpc: RpcLabels) {
        self.registry.counter_inc(
            metrics::STARTED,
            &[("group", group), ("service", rpc.service), ("method", rpc.method)],
        );
    }

    /// Record completion, with its error attribution if the call failed.
    pub fn call_finished(&self, group: &str, rpc: RpcLabels, latency_secs: f64, failed: bool) {
        let labels = [("group", group), ("service", rpc.service), ("method", rpc.method)];
        self.registry.counter_inc(metrics::FINISHED, &labels);
        self.registry
            .histogram_observe(metrics::LATENCY, &labels, latency_secs);
        if failed {
            self.registry.counter_inc(metrics::ERR, &labels);
        }
    }

    /// Render the registry as Prometheus text.
    pub fn export(&self) -> String {
        self.registry.export_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_counters() {
        let registry = MetricsRegistry::new();

        registry.counter_inc("test.counter", &[("group", "sw")]);
        assert_eq!(registry.counter_get("test.counter", &[("group", "sw")]), 1);

        registry.counter_add("test.counter", &[("group", "sw")], 5);
        assert_eq!(registry.counter_get("test.counter", &[("group", "sw")]), 6);
        assert_eq!(registry.counter_get("test.counter", &[("group", "other")]), 0);
    }

    #[test]
    fn test_metrics_registry_histograms() {
        let registry = MetricsRegistry::new();

        registry.histogram_observe("test.histogram", &[], 10.0);
        registry.histogram_observe("test.histogram", &[], 20.0);
        registry.histogram_observe("test.histogram", &[], 30.0);

        let snapshot = registry.histogram_get("test.histogram", &[]).unwrap();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.sum, 60.0);
    }

    #[test]
    fn test_call_error_attribution() {
        let metrics = LiaisonMetrics::new();
        metrics.call_started("sw", RpcLabels::STREAM_QUERY);
        metrics.call_finished("sw", RpcLabels::STREAM_QUERY, 0.01, true);

        let labels = [("group", "sw"), ("service", "stream"), ("method", "query")];
        assert_eq!(metrics.registry().counter_get(metrics::STARTED, &labels), 1);
        assert_eq!(metrics.registry().counter_get(metrics::FINISHED, &labels), 1);
        assert_eq!(metrics.registry().counter_get(metrics::ERR, &labels), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = LiaisonMetrics::new();
        metrics.msg_received("sw", RpcLabels::STREAM_WRITE);
        metrics.msg_received("sw", RpcLabels::STREAM_WRITE);
        metrics.stream_finished(RpcLabels::STREAM_WRITE, 0.5);

        let output = metrics.export();
        assert!(output.contains("# TYPE liaison_grpc_total_stream_msg_received counter\n"));
        assert!(output.contains(
            "liaison_grpc_total_stream_msg_received{group=\"sw\",service=\"stream\",method=\"write\"} 2"
        ));
        assert!(output.contains(
            "liaison_grpc_total_stream_latency_count{service=\"stream\",method=\"write\"} 1"
        ));
    }
}
