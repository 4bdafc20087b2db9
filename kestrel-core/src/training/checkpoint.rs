//! Checkpoint and inference-artifact directories.
//!
//! A checkpoint directory holds the weights, the optimizer state, a `model.yml`
//! metadata document and, last of all, an empty `.success` marker. Readers treat a
//! directory without the marker as absent.

use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{InputSpec, Network, Optimizer};
use crate::error::{CheckpointError, Result};
use crate::metrics::{MetricMap, primary_metric};
use crate::persistence::{
    atomic_write, atomic_write_json, atomic_write_yaml, has_success_marker, load_yaml,
    prepare_artifact_dir, write_success_marker,
};
use crate::registry::{ModelConfig, ModelFamily};
use crate::training::state::{ModelStatus, PruningState, TrainingState};

pub const MODEL_PARAMS: &str = "model.pdparams";
pub const OPTIMIZER_STATE: &str = "model.pdopt";
pub const MODEL_META: &str = "model.yml";
pub const EVAL_DETAILS: &str = "eval_details.json";
pub const PRUNE_META: &str = "prune.yml";
pub const INFERENCE_DIR: &str = "inference_model";
pub const INFERENCE_PROGRAM: &str = "model.pdmodel";
pub const INFERENCE_PARAMS: &str = "model.pdiparams";

/// Raw per-batch prediction arrays kept from the last detailed evaluation.
pub type EvalDetails = Vec<ArrayD<f32>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAttributes {
    pub model_type: ModelFamily,
    pub num_classes: usize,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    /// Primary evaluation metric only.
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub eval_metrics: MetricMap,
}

/// Contents of `model.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub version: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "_Attributes")]
    pub attributes: ModelAttributes,
    #[serde(rename = "_init_params")]
    pub init_params: serde_yaml::Mapping,
    #[serde(rename = "Transforms", default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<serde_yaml::Value>,
    pub completed_epochs: usize,
    pub status: ModelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_state: Option<TrainingState>,
}

impl ModelInfo {
    /// Rebuild the validated model configuration, labels included.
    pub fn model_config(&self) -> Result<ModelConfig> {
        let mut config = ModelConfig::from_init_params(&self.model, &self.init_params)?;
        if let Some(labels) = &self.attributes.labels {
            config.bind_labels(labels.clone());
        }
        Ok(config)
    }
}

/// Everything besides the network and optimizer that goes into an artifact directory.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactMeta<'a> {
    pub config: &'a ModelConfig,
    pub status: ModelStatus,
    pub state: &'a TrainingState,
    pub eval_metrics: Option<&'a MetricMap>,
    pub eval_details: Option<&'a EvalDetails>,
    pub pruning: Option<&'a PruningState>,
    pub transforms: &'a [serde_yaml::Value],
}

impl ArtifactMeta<'_> {
    pub fn model_info(&self, status: ModelStatus) -> ModelInfo {
        let mut eval_metrics = MetricMap::new();
        if let Some((key, value)) = self.eval_metrics.and_then(primary_metric) {
            eval_metrics.insert(key.to_string(), value);
        }
        ModelInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            model: self.config.architecture().to_string(),
            attributes: ModelAttributes {
                model_type: self.config.family(),
                num_classes: self.config.num_classes(),
                labels: self.config.labels().map(<[String]>::to_vec),
                eval_metrics,
            },
            init_params: self.config.init_params(),
            transforms: self.transforms.to_vec(),
            completed_epochs: self.state.completed_epochs,
            status,
            training_state: (status != ModelStatus::Infer).then(|| self.state.clone()),
        }
    }

    fn pruning_to_write(&self) -> Option<&PruningState> {
        if self.status == ModelStatus::Pruned {
            self.pruning
        } else {
            None
        }
    }
}

/// A checkpoint read back from disk.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub info: ModelInfo,
    pub params: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
    pub pruning: Option<PruningState>,
}

/// Write a complete checkpoint directory.
pub fn save_model(
    dir: &Path,
    net: &dyn Network,
    optimizer: Option<&dyn Optimizer>,
    meta: &ArtifactMeta<'_>,
) -> Result<()> {
    prepare_artifact_dir(dir)?;
    atomic_write(&dir.join(MODEL_PARAMS), &net.state_dict()?)?;
    if let Some(optimizer) = optimizer {
        atomic_write(&dir.join(OPTIMIZER_STATE), &optimizer.state_dict()?)?;
    }
    atomic_write_yaml(&dir.join(MODEL_META), &meta.model_info(meta.status))?;

    if let Some(details) = meta.eval_details {
        atomic_write_json(&dir.join(EVAL_DETAILS), &details_to_nested(details))?;
    }
    if let Some(pruning) = meta.pruning_to_write() {
        atomic_write_yaml(&dir.join(PRUNE_META), pruning)?;
    }

    write_success_marker(dir)?;
    info!("Model saved in {}.", dir.display());
    Ok(())
}

/// Trace `net` and write `save_dir/inference_model`. Returns the directory written.
pub fn export_inference_model(
    save_dir: &Path,
    net: &mut dyn Network,
    inputs: &[InputSpec],
    meta: &ArtifactMeta<'_>,
) -> Result<PathBuf> {
    let dir = save_dir.join(INFERENCE_DIR);
    let graph = net.export(inputs)?;

    prepare_artifact_dir(&dir)?;
    atomic_write(&dir.join(INFERENCE_PROGRAM), &graph.program)?;
    atomic_write(&dir.join(INFERENCE_PARAMS), &graph.params)?;
    if let Some(pruning) = meta.pruning_to_write() {
        atomic_write_yaml(&dir.join(PRUNE_META), pruning)?;
    }
    atomic_write_yaml(&dir.join(MODEL_META), &meta.model_info(ModelStatus::Infer))?;
    write_success_marker(&dir)?;
    info!(
        "The model for the inference deployment is saved in {}.",
        dir.display()
    );
    Ok(dir)
}

/// Check the success marker and parse `model.yml`.
pub fn validate_checkpoint(dir: &Path) -> Result<ModelInfo> {
    if !dir.is_dir() {
        return Err(CheckpointError::NotFound {
            path: dir.to_path_buf(),
        }
        .into());
    }
    if !has_success_marker(dir) {
        return Err(CheckpointError::Incomplete {
            path: dir.to_path_buf(),
        }
        .into());
    }

    let info: ModelInfo = load_yaml(&dir.join(MODEL_META))
        .map_err(|e| CheckpointError::InvalidMetadata {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?
        .ok_or_else(|| missing(dir, MODEL_META))?;

    let required: &[&str] = match info.status {
        ModelStatus::Infer => &[INFERENCE_PROGRAM, INFERENCE_PARAMS],
        ModelStatus::Normal | ModelStatus::Pruned => &[MODEL_PARAMS],
    };
    if let Some(file) = required.iter().find(|f| !dir.join(f).is_file()) {
        return Err(missing(dir, file).into());
    }
    Ok(info)
}

/// Read a checkpoint directory written by [`save_model`].
pub fn load_model(dir: &Path) -> Result<LoadedCheckpoint> {
    let info = validate_checkpoint(dir)?;
    if info.status == ModelStatus::Infer {
        return Err(CheckpointError::InvalidMetadata {
            path: dir.to_path_buf(),
            message: "inference artifacts cannot be loaded for training".to_string(),
        }
        .into());
    }
    let params = std::fs::read(dir.join(MODEL_PARAMS))?;
    let opt_path = dir.join(OPTIMIZER_STATE);
    let optimizer = if opt_path.is_file() {
        Some(std::fs::read(opt_path)?)
    } else {
        None
    };
    let pruning = if info.status == ModelStatus::Pruned {
        let pruning: Option<PruningState> = load_yaml(&dir.join(PRUNE_META)).map_err(|e| {
            CheckpointError::InvalidMetadata {
                path: dir.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        Some(pruning.ok_or_else(|| missing(dir, PRUNE_META))?)
    } else {
        None
    };
    Ok(LoadedCheckpoint {
        path: dir.to_path_buf(),
        info,
        params,
        optimizer,
        pruning,
    })
}

fn missing(dir: &Path, file: &str) -> CheckpointError {
    CheckpointError::MissingFile {
        path: dir.to_path_buf(),
        file: file.to_string(),
    }
}

fn details_to_nested(details: &EvalDetails) -> Vec<Vec<Vec<f32>>> {
    details
        .iter()
        .map(|batch| {
            batch
                .outer_iter()
                .map(|row| row.iter().copied().collect())
                .collect()
        })
        .collect()
}
