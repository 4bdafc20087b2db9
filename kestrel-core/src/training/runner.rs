//! Task runners: one forward step per batch, producing named metrics.
//!
//! The lifecycle controller is task-agnostic. Everything task-specific about a batch
//! (how the network is called, which loss and metrics come out, what the exported input
//! looks like) lives behind [`ModelRunner`]. [`ClassifierRunner`] is the image
//! classification implementation.

use ndarray::{Array2, ArrayD, Axis, Ix2};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{InputSpec, Network};
use crate::error::{ConfigError, EngineError, Result};
use crate::metrics::MetricMap;
use crate::registry::ModelConfig;

/// Which pass a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Train,
    Eval,
    Test,
}

/// Result of one runner invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Ordered metrics. In train mode the first key is the loss; in eval mode the first
    /// key is the primary metric.
    pub metrics: MetricMap,
    pub prediction: Option<ArrayD<f32>>,
}

/// Task-specific forward logic driven by the lifecycle controller.
pub trait ModelRunner {
    type Batch;

    /// Run `net` on one batch. In train mode the engine keeps the graph so the caller
    /// can call `backward` afterwards.
    fn run(&self, net: &mut dyn Network, batch: &Self::Batch, mode: RunMode) -> Result<RunOutput>;

    /// Input declaration used when exporting a static graph. `image_shape` is `[H, W]`;
    /// `None` leaves the spatial dims dynamic.
    fn input_spec(&self, image_shape: Option<[usize; 2]>) -> Vec<InputSpec>;

    /// Concrete single-sample input built from `batch`, used for FLOPs accounting.
    fn template_input(&self, batch: &Self::Batch) -> Vec<InputSpec>;
}

/// A batch of NCHW images with their integer class labels.
///
/// `labels` may be empty for batches that are only used for prediction.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub images: ArrayD<f32>,
    pub labels: Vec<i64>,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.images.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entry of a top-k prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub category_id: usize,
    pub category: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct ClassifierRunner {
    num_classes: usize,
    fixed_export_shape: Option<[usize; 2]>,
}

impl ClassifierRunner {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            num_classes: config.num_classes(),
            fixed_export_shape: config.descriptor().fixed_export_shape,
        }
    }

    /// Top-k width for the secondary accuracy metric.
    pub fn topk(&self) -> usize {
        self.num_classes.clamp(1, 5)
    }

    /// Top-k labelled scores for each row of a probability matrix.
    pub fn postprocess(
        probs: &ArrayD<f32>,
        labels: &[String],
        topk: usize,
    ) -> Result<Vec<Vec<ClassScore>>> {
        let probs = as_matrix(probs)?;
        let results = probs
            .axis_iter(Axis(0))
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
                order
                    .into_iter()
                    .take(topk)
                    .map(|id| ClassScore {
                        category_id: id,
                        category: labels.get(id).cloned().unwrap_or_default(),
                        score: row[id],
                    })
                    .collect()
            })
            .collect();
        Ok(results)
    }

    fn accuracies(&self, probs: &Array2<f32>, labels: &[i64]) -> Result<MetricMap> {
        if labels.len() != probs.nrows() {
            return Err(ConfigError::invalid(format!(
                "batch has {} images but {} labels",
                probs.nrows(),
                labels.len()
            ))
            .into());
        }
        let k = self.topk();
        let mut hits1 = 0usize;
        let mut hits_k = 0usize;
        for (row, &label) in probs.axis_iter(Axis(0)).zip(labels) {
            let Some(&target) = usize::try_from(label).ok().and_then(|l| row.get(l)) else {
                continue;
            };
            let rank = row.iter().filter(|&&p| p > target).count();
            if rank < 1 {
                hits1 += 1;
            }
            if rank < k {
                hits_k += 1;
            }
        }
        let n = labels.len().max(1) as f64;
        let mut metrics = MetricMap::new();
        metrics.insert("acc1".to_string(), hits1 as f64 / n);
        metrics.insert(format!("acc{k}"), hits_k as f64 / n);
        Ok(metrics)
    }
}

impl ModelRunner for ClassifierRunner {
    type Batch = ImageBatch;

    fn run(&self, net: &mut dyn Network, batch: &ImageBatch, mode: RunMode) -> Result<RunOutput> {
        let logits = net.forward(&batch.images)?;
        let probs = softmax(&as_matrix(&logits)?);

        match mode {
            RunMode::Train => {
                let loss = net.compute_loss(&batch.labels)?;
                let mut metrics = MetricMap::new();
                metrics.insert("loss".to_string(), loss);
                metrics.extend(self.accuracies(&probs, &batch.labels)?);
                Ok(RunOutput {
                    metrics,
                    prediction: None,
                })
            }
            RunMode::Eval => Ok(RunOutput {
                metrics: self.accuracies(&probs, &batch.labels)?,
                prediction: Some(probs.into_dyn()),
            }),
            RunMode::Test => Ok(RunOutput {
                metrics: MetricMap::new(),
                prediction: Some(probs.into_dyn()),
            }),
        }
    }

    fn input_spec(&self, image_shape: Option<[usize; 2]>) -> Vec<InputSpec> {
        let spatial = match (image_shape, self.fixed_export_shape) {
            (Some([h, w]), _) => [Some(h), Some(w)],
            (None, Some(fixed)) => {
                info!(
                    "When exporting inference model for this architecture, image_shape is [{}, {}]",
                    fixed[0], fixed[1]
                );
                [Some(fixed[0]), Some(fixed[1])]
            }
            (None, None) => [None, None],
        };
        vec![InputSpec::float32(
            "image",
            vec![None, Some(3), spatial[0], spatial[1]],
        )]
    }

    fn template_input(&self, batch: &ImageBatch) -> Vec<InputSpec> {
        let mut shape: Vec<Option<usize>> = batch.images.shape().iter().copied().map(Some).collect();
        if let Some(first) = shape.first_mut() {
            *first = Some(1);
        }
        vec![InputSpec::float32("image", shape)]
    }
}

fn as_matrix(values: &ArrayD<f32>) -> Result<Array2<f32>> {
    values
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|e| EngineError::forward(format!("expected [batch, classes] output: {e}")).into())
}

/// Row-wise softmax with max subtraction.
fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f32 = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClassifierParams;
    use ndarray::array;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let p = softmax(&array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        for row in p.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!(p[[0, 2]] > p[[0, 1]]);
    }

    #[test]
    fn test_topk_width() {
        let small = ModelConfig::new("ResNet18", 3, ClassifierParams::default()).unwrap();
        let big = ModelConfig::new("ResNet18", 100, ClassifierParams::default()).unwrap();
        assert_eq!(ClassifierRunner::new(&small).topk(), 3);
        assert_eq!(ClassifierRunner::new(&big).topk(), 5);
    }

    #[test]
    fn test_accuracies() {
        let cfg = ModelConfig::new("ResNet18", 3, ClassifierParams::default()).unwrap();
        let runner = ClassifierRunner::new(&cfg);
        let probs = array![[0.7f32, 0.2, 0.1], [0.1, 0.3, 0.6]];
        let m = runner.accuracies(&probs, &[0, 1]).unwrap();
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["acc1", "acc3"]);
        assert!((m["acc1"] - 0.5).abs() < 1e-12);
        assert!((m["acc3"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_postprocess_topk() {
        let probs = array![[0.1f32, 0.6, 0.3]].into_dyn();
        let labels = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let out = ClassifierRunner::postprocess(&probs, &labels, 2).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0].category, "b");
        assert_eq!(out[0][1].category_id, 2);
    }

    #[test]
    fn test_input_spec_fixed_shape() {
        let alex = ModelConfig::new("AlexNet", 10, ClassifierParams::default()).unwrap();
        let spec = ClassifierRunner::new(&alex).input_spec(None);
        assert_eq!(spec[0].shape, vec![None, Some(3), Some(224), Some(224)]);

        let resnet = ModelConfig::new("ResNet50", 10, ClassifierParams::default()).unwrap();
        let spec = ClassifierRunner::new(&resnet).input_spec(None);
        assert_eq!(spec[0].shape, vec![None, Some(3), None, None]);
        let spec = ClassifierRunner::new(&resnet).input_spec(Some([128, 96]));
        assert_eq!(spec[0].shape, vec![None, Some(3), Some(128), Some(96)]);
    }
}
