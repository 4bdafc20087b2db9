//! Metric accumulation for the training loop.
//!
//! Two independent policies: a sliding window of step durations used only for ETA
//! estimation, and a per-epoch running mean over named scalar metrics.

use indexmap::IndexMap;
use std::collections::VecDeque;

/// Ordered name → value mapping. The first key is the primary metric.
pub type MetricMap = IndexMap<String, f64>;

/// Return the primary (first) entry of a metric mapping.
pub fn primary_metric(metrics: &MetricMap) -> Option<(&str, f64)> {
    metrics.first().map(|(k, v)| (k.as_str(), *v))
}

/// Render metrics as `k=v, k=v` with six decimals.
pub fn format_metrics(metrics: &MetricMap) -> String {
    metrics
        .iter()
        .map(|(k, v)| format!("{k}={v:.6}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Sliding window over the most recent `window` samples.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: usize,
    values: VecDeque<f64>,
}

impl SmoothedValue {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    /// Push a sample, evicting the oldest once the window is full.
    pub fn update(&mut self, value: f64) {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Arithmetic mean of the retained samples, `0.0` when empty.
    pub fn avg(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Running mean per metric key since the last reset.
///
/// Every batch carries equal weight. Keys are tracked independently, so a metric that
/// is missing from some batches is averaged only over the batches that reported it.
#[derive(Debug, Clone, Default)]
pub struct TrainingStats {
    meters: IndexMap<String, RunningMean>,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch's scalar metrics into the running means.
    pub fn update(&mut self, batch: &MetricMap) {
        for (key, value) in batch {
            let meter = self.meters.entry(key.clone()).or_default();
            meter.sum += *value;
            meter.count += 1;
        }
    }

    /// Per-key means in first-seen order.
    pub fn get(&self) -> MetricMap {
        self.meters
            .iter()
            .map(|(k, m)| (k.clone(), m.mean()))
            .collect()
    }

    /// Human-readable summary of [`TrainingStats::get`].
    pub fn log(&self) -> String {
        format_metrics(&self.get())
    }

    pub fn reset(&mut self) {
        self.meters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }
}
