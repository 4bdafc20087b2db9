//! In-memory stand-ins for the tensor engine and a dataset, shared by the
//! integration tests.
//!
//! `MockNet` classifies a sample correctly when its difficulty (feature 1) is below the
//! network's current accuracy. The accuracy for each evaluation pass comes from a script
//! when one is given; otherwise it shrinks with the share of zeroed filters, which is
//! what sensitivity analysis needs to see.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use ndarray::{Array2, ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use kestrel_core::data::{Dataset, EpochAware};
use kestrel_core::distributed::DistributedContext;
use kestrel_core::engine::{
    ExportedGraph, InputSpec, NetMode, Network, Optimizer, ParamInfo, PrunableNetwork,
};
use kestrel_core::error::{EngineError, Result};
use kestrel_core::registry::{ClassifierParams, ModelConfig};
use kestrel_core::training::{ImageBatch, RunMode};

pub const NUM_CLASSES: usize = 3;
pub const PRUNABLE: [&str; 2] = ["conv1.weight", "conv2.weight"];

/// Counters shared between a mock and the test that owns it.
#[derive(Debug, Default)]
pub struct Probe {
    pub forward_calls: usize,
    pub backward_calls: usize,
    pub sync_calls: usize,
    pub optimizer_steps: usize,
    pub eval_rounds: usize,
    pub state_dicts: usize,
    pub lrs: Vec<f64>,
    pub pretrained: Vec<String>,
    pub removed: Vec<(String, Vec<usize>)>,
    pub exported: Vec<Vec<InputSpec>>,
}

pub type SharedProbe = Arc<Mutex<Probe>>;

pub fn probe() -> SharedProbe {
    Arc::new(Mutex::new(Probe::default()))
}

#[derive(Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

pub struct MockNet {
    mode: NetMode,
    grad_enabled: bool,
    weights: BTreeMap<String, ArrayD<f32>>,
    script: VecDeque<f64>,
    accuracy: f64,
    loss: f64,
    probe: SharedProbe,
}

impl MockNet {
    pub fn new(probe: SharedProbe) -> Self {
        let mut weights = BTreeMap::new();
        for (name, shape) in [
            ("conv1.weight", [16usize, 8]),
            ("conv2.weight", [32, 16]),
            ("fc.weight", [NUM_CLASSES, 32]),
        ] {
            let w = Array2::from_shape_fn(shape, |(i, j)| 1.0 + i as f32 + 0.01 * j as f32);
            weights.insert(name.to_string(), w.into_dyn());
        }
        Self {
            mode: NetMode::Train,
            grad_enabled: true,
            weights,
            script: VecDeque::new(),
            accuracy: 0.9,
            loss: 2.0,
            probe,
        }
    }

    /// Accuracy of successive evaluation passes.
    pub fn with_script(mut self, accuracies: &[f64]) -> Self {
        self.script = accuracies.iter().copied().collect();
        self
    }

    pub fn filter_count(&self, name: &str) -> usize {
        self.weights[name].len_of(Axis(0))
    }

    fn weight_based_accuracy(&self) -> f64 {
        PRUNABLE.iter().fold(0.9, |acc, name| {
            let w = &self.weights[*name];
            let live = w
                .axis_iter(Axis(0))
                .filter(|f| f.iter().any(|v| *v != 0.0))
                .count();
            acc * live as f64 / w.len_of(Axis(0)) as f64
        })
    }
}

impl Network for MockNet {
    fn set_mode(&mut self, mode: NetMode) {
        if mode == NetMode::Eval {
            self.accuracy = match self.script.pop_front() {
                Some(acc) => acc,
                None => self.weight_based_accuracy(),
            };
            self.probe.lock().unwrap().eval_rounds += 1;
        }
        self.mode = mode;
    }

    fn mode(&self) -> NetMode {
        self.mode
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> std::result::Result<ArrayD<f32>, EngineError> {
        self.probe.lock().unwrap().forward_calls += 1;
        let rows = input.len_of(Axis(0));
        let mut logits = Array2::<f32>::zeros((rows, NUM_CLASSES));
        for (i, sample) in input.axis_iter(Axis(0)).enumerate() {
            let label = sample[IxDyn(&[0])] as usize % NUM_CLASSES;
            let difficulty = sample[IxDyn(&[1])] as f64;
            let correct = self.mode == NetMode::Train || difficulty < self.accuracy;
            let predicted = if correct {
                label
            } else {
                (label + 1) % NUM_CLASSES
            };
            logits[[i, predicted]] = 10.0;
        }
        Ok(logits.into_dyn())
    }

    fn compute_loss(&mut self, _labels: &[i64]) -> std::result::Result<f64, EngineError> {
        if !self.grad_enabled {
            return Err(EngineError::forward("loss requested with gradients disabled"));
        }
        self.loss *= 0.9;
        Ok(self.loss)
    }

    fn backward(&mut self) -> std::result::Result<(), EngineError> {
        self.probe.lock().unwrap().backward_calls += 1;
        Ok(())
    }

    fn sync_gradients(
        &mut self,
        ctx: &dyn DistributedContext,
    ) -> std::result::Result<(), EngineError> {
        ctx.all_reduce_sum(1.0)?;
        self.probe.lock().unwrap().sync_calls += 1;
        Ok(())
    }

    fn parameters(&self) -> Vec<ParamInfo> {
        self.weights
            .iter()
            .map(|(name, w)| ParamInfo {
                name: name.clone(),
                shape: w.shape().to_vec(),
                prunable: true,
            })
            .collect()
    }

    fn state_dict(&self) -> std::result::Result<Vec<u8>, EngineError> {
        self.probe.lock().unwrap().state_dicts += 1;
        let stored: BTreeMap<&String, StoredTensor> = self
            .weights
            .iter()
            .map(|(name, w)| {
                (
                    name,
                    StoredTensor {
                        shape: w.shape().to_vec(),
                        data: w.iter().copied().collect(),
                    },
                )
            })
            .collect();
        serde_json::to_vec(&stored).map_err(|e| EngineError::state(e.to_string()))
    }

    fn load_state_dict(&mut self, state: &[u8]) -> std::result::Result<(), EngineError> {
        let stored: BTreeMap<String, StoredTensor> =
            serde_json::from_slice(state).map_err(|e| EngineError::state(e.to_string()))?;
        for (name, tensor) in stored {
            let current = self
                .weights
                .get(&name)
                .ok_or_else(|| EngineError::state(format!("unexpected parameter {name}")))?;
            if current.shape() != tensor.shape.as_slice() {
                return Err(EngineError::state(format!(
                    "shape mismatch for {name}: {:?} vs {:?}",
                    current.shape(),
                    tensor.shape
                )));
            }
            let array = ArrayD::from_shape_vec(IxDyn(&tensor.shape), tensor.data)
                .map_err(|e| EngineError::state(e.to_string()))?;
            self.weights.insert(name, array);
        }
        Ok(())
    }

    fn load_pretrained(&mut self, source: &str) -> std::result::Result<(), EngineError> {
        self.probe.lock().unwrap().pretrained.push(source.to_string());
        Ok(())
    }

    fn export(&mut self, inputs: &[InputSpec]) -> std::result::Result<ExportedGraph, EngineError> {
        self.probe.lock().unwrap().exported.push(inputs.to_vec());
        Ok(ExportedGraph {
            program: b"graph".to_vec(),
            params: self.state_dict()?,
        })
    }

    fn pruning(&mut self) -> Option<&mut dyn PrunableNetwork> {
        Some(self)
    }
}

impl PrunableNetwork for MockNet {
    fn parameter(&self, name: &str) -> std::result::Result<ArrayD<f32>, EngineError> {
        self.weights
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::state(format!("no parameter {name}")))
    }

    fn set_parameter(
        &mut self,
        name: &str,
        value: ArrayD<f32>,
    ) -> std::result::Result<(), EngineError> {
        match self.weights.get_mut(name) {
            Some(w) if w.shape() == value.shape() => {
                *w = value;
                Ok(())
            }
            _ => Err(EngineError::state(format!("cannot set {name}"))),
        }
    }

    fn flops(&self, _inputs: &[InputSpec]) -> std::result::Result<u64, EngineError> {
        Ok(self.weights.values().map(|w| 2 * w.len() as u64).sum())
    }

    fn layer_flops(
        &self,
        _inputs: &[InputSpec],
    ) -> std::result::Result<BTreeMap<String, u64>, EngineError> {
        Ok(self
            .weights
            .iter()
            .map(|(name, w)| (name.clone(), 2 * w.len() as u64))
            .collect())
    }

    fn remove_filters(
        &mut self,
        name: &str,
        filters: &[usize],
    ) -> std::result::Result<(), EngineError> {
        let w = self
            .weights
            .get(name)
            .ok_or_else(|| EngineError::state(format!("no parameter {name}")))?;
        let keep: Vec<usize> = (0..w.len_of(Axis(0)))
            .filter(|i| !filters.contains(i))
            .collect();
        let pruned = w.select(Axis(0), &keep);
        self.weights.insert(name.to_string(), pruned);
        self.probe
            .lock()
            .unwrap()
            .removed
            .push((name.to_string(), filters.to_vec()));
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct OptimizerState {
    lr: f64,
    steps: usize,
}

pub struct MockOptimizer {
    lr: f64,
    steps: usize,
    probe: SharedProbe,
}

impl MockOptimizer {
    pub fn new(lr: f64, probe: SharedProbe) -> Self {
        Self { lr, steps: 0, probe }
    }
}

impl Optimizer for MockOptimizer {
    fn step(&mut self, _net: &mut dyn Network) -> std::result::Result<(), EngineError> {
        self.steps += 1;
        let mut probe = self.probe.lock().unwrap();
        probe.optimizer_steps += 1;
        probe.lrs.push(self.lr);
        Ok(())
    }

    fn clear_grad(&mut self, _net: &mut dyn Network) {}

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> std::result::Result<Vec<u8>, EngineError> {
        serde_json::to_vec(&OptimizerState {
            lr: self.lr,
            steps: self.steps,
        })
        .map_err(|e| EngineError::state(e.to_string()))
    }

    fn load_state_dict(&mut self, state: &[u8]) -> std::result::Result<(), EngineError> {
        let state: OptimizerState =
            serde_json::from_slice(state).map_err(|e| EngineError::state(e.to_string()))?;
        self.lr = state.lr;
        self.steps = state.steps;
        Ok(())
    }
}

/// Samples are `[label, difficulty]` feature pairs.
pub struct MockDataset {
    samples: Vec<(i64, f32)>,
    labels: Vec<String>,
    shuffle: bool,
    pub epochs_seen: Vec<usize>,
    pub mode: Option<RunMode>,
}

impl MockDataset {
    /// `n` samples with difficulties `0, 1/n, 2/n, ...`.
    pub fn new(n: usize) -> Self {
        Self::from_difficulties((0..n).map(|i| i as f32 / n as f32).collect())
    }

    pub fn from_difficulties(difficulties: Vec<f32>) -> Self {
        let samples = difficulties
            .into_iter()
            .enumerate()
            .map(|(i, d)| ((i % NUM_CLASSES) as i64, d))
            .collect();
        Self {
            samples,
            labels: vec!["cat".into(), "dog".into(), "bird".into()],
            shuffle: false,
            epochs_seen: Vec::new(),
            mode: None,
        }
    }

    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }
}

impl Dataset for MockDataset {
    type Sample = (i64, f32);
    type Batch = ImageBatch;

    fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<(i64, f32)> {
        Ok(self.samples[index])
    }

    fn collate(&self, samples: Vec<(i64, f32)>) -> Result<ImageBatch> {
        let rows = samples.len();
        let flat: Vec<f32> = samples
            .iter()
            .flat_map(|(label, d)| [*label as f32, *d])
            .collect();
        let images = ArrayD::from_shape_vec(IxDyn(&[rows, 2]), flat)
            .map_err(|e| EngineError::forward(e.to_string()))?;
        Ok(ImageBatch {
            images,
            labels: samples.iter().map(|(label, _)| *label).collect(),
        })
    }

    fn shuffle(&self) -> bool {
        self.shuffle
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn set_transform_mode(&mut self, mode: RunMode) {
        self.mode = Some(mode);
    }

    fn transforms(&self) -> Vec<serde_yaml::Value> {
        vec![serde_yaml::from_str("{Normalize: {mean: [0.5], std: [0.5]}}").unwrap()]
    }

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        Some(self)
    }
}

impl EpochAware for MockDataset {
    fn set_epoch(&mut self, epoch: usize) {
        self.epochs_seen.push(epoch);
    }
}

pub fn model_config() -> ModelConfig {
    ModelConfig::new("ResNet18", NUM_CLASSES, ClassifierParams::default()).unwrap()
}
