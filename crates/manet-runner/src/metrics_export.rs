//! Metrics export for simulation results.
//!
//! [`InMemoryRecorder`] is a `metrics` recorder that keeps every counter and
//! histogram series of a run in memory. Once the run is over a
//! [`MetricsSnapshot`] aggregates the series per metric name, per node and per
//! extra label, and is written as JSON or Prometheus text.
//!
//! The simulator publishes no gauges; gauge registrations are accepted and
//! discarded.

use metrics::{Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Label that splits a series per simulated node.
const NODE_LABEL: &str = "node";

// ============================================================================
// Snapshot
// ============================================================================

/// Metric values of a single node.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NodeMetrics {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Aggregated view of everything recorded during a run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Counter totals over all series of a metric name.
    pub counters: BTreeMap<String, u64>,
    /// Histogram summaries over all series of a metric name.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Counter totals split by the labels other than `node`, keyed like
    /// `manet.ip.drops{reason=no_route}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labelled_counters: BTreeMap<String, u64>,
    /// Breakdown by the `node` label.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
}

impl MetricsSnapshot {
    /// Total of a counter across all nodes and labels.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Value of a counter on one node.
    pub fn node_counter(&self, node: &str, name: &str) -> u64 {
        self.nodes
            .get(node)
            .and_then(|m| m.counters.get(name))
            .copied()
            .unwrap_or(0)
    }
}

/// Distribution of the samples of a histogram.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl HistogramSummary {
    /// Summarize `samples`; percentiles use the nearest-rank method.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len();
        let rank = |p: f64| sorted[((p * n as f64).ceil() as usize).clamp(1, n) - 1];
        let sum: f64 = sorted.iter().sum();
        HistogramSummary {
            count: n as u64,
            sum,
            min: sorted[0],
            max: sorted[n - 1],
            mean: sum / n as f64,
            p50: rank(0.50),
            p90: rank(0.90),
            p99: rank(0.99),
        }
    }
}

// ============================================================================
// Export
// ============================================================================

/// Write the snapshot as pretty-printed JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)
}

/// Write the snapshot in the Prometheus text exposition format.
///
/// Each counter gets its total plus one sample per node; histograms are
/// exposed as summaries.
pub fn export_prometheus<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    for (name, total) in &snapshot.counters {
        let metric = prometheus_name(name);
        writeln!(writer, "# TYPE {} counter", metric)?;
        writeln!(writer, "{} {}", metric, total)?;
        for (node, values) in &snapshot.nodes {
            if let Some(value) = values.counters.get(name) {
                writeln!(writer, "{}{{{}=\"{}\"}} {}", metric, NODE_LABEL, node, value)?;
            }
        }
    }

    for (name, summary) in &snapshot.histograms {
        let metric = prometheus_name(name);
        writeln!(writer, "# TYPE {} summary", metric)?;
        for (quantile, value) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
            writeln!(writer, "{}{{quantile=\"{}\"}} {}", metric, quantile, value)?;
        }
        writeln!(writer, "{}_sum {}", metric, summary.sum)?;
        writeln!(writer, "{}_count {}", metric, summary.count)?;
    }
    Ok(())
}

fn prometheus_name(name: &str) -> String {
    name.replace('.', "_")
}

// ============================================================================
// Series Storage
// ============================================================================

/// Identity of one series: metric name plus its labels in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(key: &Key) -> Self {
        let mut labels: Vec<(String, String)> = key
            .labels()
            .map(|l| (l.key().to_string(), l.value().to_string()))
            .collect();
        labels.sort();
        SeriesKey {
            name: key.name().to_string(),
            labels,
        }
    }

    fn node(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == NODE_LABEL)
            .map(|(_, v)| v.as_str())
    }

    /// `name{k=v,...}` over the labels other than `node`.
    fn qualified_name(&self) -> Option<String> {
        let extra: Vec<String> = self
            .labels
            .iter()
            .filter(|(k, _)| k != NODE_LABEL)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        (!extra.is_empty()).then(|| format!("{}{{{}}}", self.name, extra.join(",")))
    }
}

/// Recorded samples of one histogram series.
#[derive(Debug, Default)]
struct Samples(Mutex<Vec<f64>>);

impl HistogramFn for Samples {
    fn record(&self, value: f64) {
        self.0.lock().push(value);
    }
}

type SeriesMap<T> = RwLock<BTreeMap<SeriesKey, Arc<T>>>;

#[derive(Debug, Default)]
struct Registry {
    counters: SeriesMap<AtomicU64>,
    histograms: SeriesMap<Samples>,
}

/// Handle of the series for `key`, created on first use.
fn series<T: Default>(map: &SeriesMap<T>, key: &Key) -> Arc<T> {
    let key = SeriesKey::new(key);
    if let Some(existing) = map.read().get(&key) {
        return Arc::clone(existing);
    }
    Arc::clone(map.write().entry(key).or_default())
}

impl Registry {
    fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();

        for (key, value) in self.counters.read().iter() {
            let value = value.load(Ordering::Relaxed);
            *snapshot.counters.entry(key.name.clone()).or_default() += value;
            if let Some(qualified) = key.qualified_name() {
                *snapshot.labelled_counters.entry(qualified).or_default() += value;
            }
            if let Some(node) = key.node() {
                let per_node = snapshot.nodes.entry(node.to_string()).or_default();
                *per_node.counters.entry(key.name.clone()).or_default() += value;
            }
        }

        let histograms = self.histograms.read();
        let mut merged: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        let mut per_node: BTreeMap<(&str, &str), Vec<f64>> = BTreeMap::new();
        for (key, samples) in histograms.iter() {
            let samples = samples.0.lock();
            merged.entry(key.name.as_str()).or_default().extend_from_slice(&samples);
            if let Some(node) = key.node() {
                per_node
                    .entry((node, key.name.as_str()))
                    .or_default()
                    .extend_from_slice(&samples);
            }
        }
        for (name, samples) in merged {
            snapshot
                .histograms
                .insert(name.to_string(), HistogramSummary::from_samples(&samples));
        }
        for ((node, name), samples) in per_node {
            snapshot
                .nodes
                .entry(node.to_string())
                .or_default()
                .histograms
                .insert(name.to_string(), HistogramSummary::from_samples(&samples));
        }
        snapshot
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// In-memory metrics recorder that collects a run's metrics for export.
///
/// Clones share storage: install one clone as the recorder and take
/// snapshots from another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    registry: Arc<Registry>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate everything recorded so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(series(&self.registry.counters, key))
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(series(&self.registry.histograms, key))
    }
}
