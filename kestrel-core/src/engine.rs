//! Seams to the external tensor/autograd engine.
//!
//! Kestrel never looks inside a network. It drives one through [`Network`], updates it
//! through [`Optimizer`], and, for architectures that allow it, edits filters through
//! [`PrunableNetwork`]. Tensors crossing the seam are host-side `ndarray` arrays.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::distributed::DistributedContext;
use crate::error::EngineError;

/// Train/eval switch for layers such as dropout and batch norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    Train,
    Eval,
}

/// Name and shape of one trainable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub shape: Vec<usize>,
    /// Whether filters (leading-dimension slices) of this parameter can be removed.
    #[serde(default)]
    pub prunable: bool,
}

impl ParamInfo {
    pub fn leading_dim(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// Declared input of a traced graph. `None` dimensions are dynamic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<Option<usize>>,
    pub dtype: String,
}

impl InputSpec {
    pub fn float32(name: impl Into<String>, shape: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: "float32".to_string(),
        }
    }
}

/// Serialized static graph produced by [`Network::export`].
#[derive(Debug, Clone, Default)]
pub struct ExportedGraph {
    pub program: Vec<u8>,
    pub params: Vec<u8>,
}

/// A trainable module owned by the engine.
pub trait Network {
    fn set_mode(&mut self, mode: NetMode);

    fn mode(&self) -> NetMode;

    /// Toggle gradient tracking for subsequent forward passes.
    fn set_grad_enabled(&mut self, enabled: bool);

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, EngineError>;

    /// Task loss of the most recent forward pass against integer class labels. The
    /// engine keeps the graph so that [`Network::backward`] can follow.
    fn compute_loss(&mut self, labels: &[i64]) -> Result<f64, EngineError>;

    fn backward(&mut self) -> Result<(), EngineError>;

    /// Average accumulated gradients across the group.
    fn sync_gradients(&mut self, ctx: &dyn DistributedContext) -> Result<(), EngineError>;

    fn parameters(&self) -> Vec<ParamInfo>;

    fn state_dict(&self) -> Result<Vec<u8>, EngineError>;

    fn load_state_dict(&mut self, state: &[u8]) -> Result<(), EngineError>;

    /// Load weights from a named source such as `IMAGENET`.
    fn load_pretrained(&mut self, source: &str) -> Result<(), EngineError> {
        Err(EngineError::unsupported(format!(
            "load pretrained weights '{source}'"
        )))
    }

    /// Trace the network against `inputs` into a static graph.
    fn export(&mut self, inputs: &[InputSpec]) -> Result<ExportedGraph, EngineError>;

    /// Structured-pruning capability, if the architecture supports it.
    fn pruning(&mut self) -> Option<&mut dyn PrunableNetwork> {
        None
    }
}

/// Filter-level access used by the pruning coordinator.
pub trait PrunableNetwork {
    fn parameter(&self, name: &str) -> Result<ArrayD<f32>, EngineError>;

    fn set_parameter(&mut self, name: &str, value: ArrayD<f32>) -> Result<(), EngineError>;

    /// Total forward FLOPs for the given input template.
    fn flops(&self, inputs: &[InputSpec]) -> Result<u64, EngineError>;

    /// FLOPs attributable to each prunable parameter.
    fn layer_flops(&self, inputs: &[InputSpec]) -> Result<BTreeMap<String, u64>, EngineError>;

    /// Physically remove the listed filters (leading-dimension indices) and every
    /// dependent channel downstream.
    fn remove_filters(&mut self, name: &str, filters: &[usize]) -> Result<(), EngineError>;
}

/// Parameter update service bound to a network.
pub trait Optimizer {
    fn step(&mut self, net: &mut dyn Network) -> Result<(), EngineError>;

    fn clear_grad(&mut self, net: &mut dyn Network);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> Result<Vec<u8>, EngineError>;

    fn load_state_dict(&mut self, state: &[u8]) -> Result<(), EngineError>;
}

/// Scope in which gradient tracking is disabled. Re-enables on drop.
pub struct NoGrad<'a> {
    net: &'a mut dyn Network,
}

impl<'a> NoGrad<'a> {
    pub fn new(net: &'a mut dyn Network) -> Self {
        net.set_grad_enabled(false);
        Self { net }
    }
}

impl<'a> Deref for NoGrad<'a> {
    type Target = dyn Network + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.net
    }
}

impl<'a> DerefMut for NoGrad<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.net
    }
}

impl Drop for NoGrad<'_> {
    fn drop(&mut self) {
        self.net.set_grad_enabled(true);
    }
}

/// Data-parallel view of a network: backward is followed by gradient averaging across
/// the group. Everything else delegates.
pub struct DataParallel<'a> {
    inner: &'a mut dyn Network,
    ctx: &'a dyn DistributedContext,
}

impl<'a> DataParallel<'a> {
    pub fn new(inner: &'a mut dyn Network, ctx: &'a dyn DistributedContext) -> Self {
        Self { inner, ctx }
    }
}

impl Network for DataParallel<'_> {
    fn set_mode(&mut self, mode: NetMode) {
        self.inner.set_mode(mode);
    }

    fn mode(&self) -> NetMode {
        self.inner.mode()
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        self.inner.set_grad_enabled(enabled);
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, EngineError> {
        self.inner.forward(input)
    }

    fn compute_loss(&mut self, labels: &[i64]) -> Result<f64, EngineError> {
        self.inner.compute_loss(labels)
    }

    fn backward(&mut self) -> Result<(), EngineError> {
        self.inner.backward()?;
        self.inner.sync_gradients(self.ctx)
    }

    fn sync_gradients(&mut self, ctx: &dyn DistributedContext) -> Result<(), EngineError> {
        self.inner.sync_gradients(ctx)
    }

    fn parameters(&self) -> Vec<ParamInfo> {
        self.inner.parameters()
    }

    fn state_dict(&self) -> Result<Vec<u8>, EngineError> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &[u8]) -> Result<(), EngineError> {
        self.inner.load_state_dict(state)
    }

    fn load_pretrained(&mut self, source: &str) -> Result<(), EngineError> {
        self.inner.load_pretrained(source)
    }

    fn export(&mut self, inputs: &[InputSpec]) -> Result<ExportedGraph, EngineError> {
        self.inner.export(inputs)
    }

    fn pruning(&mut self) -> Option<&mut dyn PrunableNetwork> {
        self.inner.pruning()
    }
}
