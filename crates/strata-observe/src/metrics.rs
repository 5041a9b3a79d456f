//! Process-local metric registry with Prometheus text exposition.
//!
//! Counters and gauges are plain maps behind mutexes; histograms carry
//! fixed bucket bounds. Label sets are canonicalized (sorted) so the same
//! metric/labels pair always lands on the same series regardless of call
//! site ordering.

use std::collections::BTreeMap;
use std::sync::Mutex;

use strata_core::MetricSink;

/// Metric names used across the pipeline.
pub mod names {
    // Counters
    pub const REQUESTS_TOTAL: &str = "requests_total";
    pub const SAFETY_BLOCKED_TOTAL: &str = "safety_blocked_total";
    pub const PII_DETECTED_TOTAL: &str = "pii_detected_total";
    pub const HALLUCINATION_VERDICT_TOTAL: &str = "hallucination_verdict_total";
    pub const LLM_ERRORS_TOTAL: &str = "llm_errors_total";
    pub const FEEDBACK_RECEIVED_TOTAL: &str = "feedback_received_total";
    pub const VARIANT_ASSIGNED_TOTAL: &str = "variant_assigned_total";
    pub const SHADOW_RUNS_TOTAL: &str = "shadow_runs_total";
    pub const SHADOW_DROPPED_TOTAL: &str = "shadow_dropped_total";

    // Histograms
    pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
    pub const RETRIEVAL_COSINE_SIMILARITY: &str = "retrieval_cosine_similarity";
    pub const TOKENS_IN_TOTAL: &str = "tokens_in_total";
    pub const TOKENS_OUT_TOTAL: &str = "tokens_out_total";
    pub const LLM_COST_USD: &str = "llm_cost_usd";

    // Gauges
    pub const EMBEDDING_CENTROID_SHIFT: &str = "embedding_centroid_shift";
    pub const RETRIEVAL_EMPTY_RESULT_RATE: &str = "retrieval_empty_result_rate";
    pub const SHADOW_BUDGET_REMAINING_USD: &str = "shadow_budget_remaining_usd";
}

const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone)]
struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Concurrent-safe, process-local metric registry.
#[derive(Default)]
pub struct MetricRegistry {
    counters: Mutex<BTreeMap<String, u64>>,
    histograms: Mutex<BTreeMap<String, Histogram>>,
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series; 0 when never incremented.
    pub fn counter_value(&self, metric: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(metric, labels);
        *self.counters.lock().unwrap().get(&key).unwrap_or(&0)
    }

    /// Current value of a gauge series.
    pub fn gauge_value(&self, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = series_key(metric, labels);
        self.gauges.lock().unwrap().get(&key).copied()
    }

    /// Observation count of a histogram series.
    pub fn histogram_count(&self, metric: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(metric, labels);
        self.histograms
            .lock()
            .unwrap()
            .get(&key)
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Sum of a histogram series.
    pub fn histogram_sum(&self, metric: &str, labels: &[(&str, &str)]) -> f64 {
        let key = series_key(metric, labels);
        self.histograms
            .lock()
            .unwrap()
            .get(&key)
            .map(|h| h.sum)
            .unwrap_or(0.0)
    }

    /// Render every series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.counters.lock().unwrap().iter() {
            out.push_str(&format!("{} {}\n", key, value));
        }
        for (key, value) in self.gauges.lock().unwrap().iter() {
            out.push_str(&format!("{} {}\n", key, value));
        }
        for (key, histogram) in self.histograms.lock().unwrap().iter() {
            let (name, labels) = split_series_key(key);
            for (bound, count) in histogram.bounds.iter().zip(histogram.counts.iter()) {
                out.push_str(&format!(
                    "{}_bucket{} {}\n",
                    name,
                    merge_le_label(&labels, *bound),
                    count
                ));
            }
            out.push_str(&format!("{}_sum{} {}\n", name, labels, histogram.sum));
            out.push_str(&format!("{}_count{} {}\n", name, labels, histogram.count));
        }
        out
    }
}

impl MetricSink for MetricRegistry {
    fn inc(&self, metric: &str, labels: &[(&str, &str)], value: u64) {
        let key = series_key(metric, labels);
        *self.counters.lock().unwrap().entry(key).or_insert(0) += value;
    }

    fn observe(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(metric, labels);
        self.histograms
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Histogram::new(DEFAULT_BUCKETS))
            .observe(value);
    }

    fn set(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(metric, labels);
        self.gauges.lock().unwrap().insert(key, value);
    }
}

/// `name{k="v",...}` with labels sorted by key; bare `name` without labels.
fn series_key(metric: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return metric.to_string();
    }
    let mut sorted: Vec<(&str, &str)> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let rendered: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", metric, rendered.join(","))
}

fn split_series_key(key: &str) -> (&str, String) {
    match key.find('{') {
        Some(idx) => (&key[..idx], key[idx..].to_string()),
        None => (key, String::new()),
    }
}

fn merge_le_label(labels: &str, bound: f64) -> String {
    if labels.is_empty() {
        format!("{{le=\"{}\"}}", bound)
    } else {
        let inner = &labels[1..labels.len() - 1];
        format!("{{{},le=\"{}\"}}", inner, bound)
    }
}
