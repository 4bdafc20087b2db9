//! Sensitivity analysis and structured filter pruning.
//!
//! Sensitivity analysis zeroes a growing share of each layer's least important filters,
//! re-evaluates, and records the relative drop of the primary metric. Pruning then picks
//! one ratio per layer by bisecting on the largest tolerated drop until the estimated
//! FLOPs reduction meets the target, and asks the engine to remove those filters.

mod criterion;

pub use criterion::{PruneCriterion, least_important, zero_filters};

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::Dataset;
use crate::engine::{InputSpec, PrunableNetwork};
use crate::error::{ConfigError, EngineError, Result};
use crate::metrics::primary_metric;
use crate::persistence::{atomic_write_json, load_json};
use crate::training::controller::LifecycleController;
use crate::training::runner::{ModelRunner, RunMode};
use crate::training::state::{ModelStatus, PruningState};

pub const SENSITIVITY_FILE: &str = "model.sensi.data";

/// Filter ratios tried for every layer during sensitivity analysis.
pub const SENSITIVITY_RATIOS: [f64; 9] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];

/// Parameters with this many filters or fewer are never pruned.
pub const MIN_PRUNABLE_FILTERS: usize = 8;

const MAX_SEARCH_STEPS: usize = 20;
const FLOPS_TOLERANCE: f64 = 0.015;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitivityPoint {
    pub ratio: f64,
    /// Relative drop of the primary metric, `(baseline - pruned) / baseline`.
    pub loss: f64,
}

/// Output of sensitivity analysis, persisted as `model.sensi.data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityTable {
    pub criterion: PruneCriterion,
    pub metric: String,
    pub baseline: f64,
    /// Single-sample input used for FLOPs accounting.
    pub inputs: Vec<InputSpec>,
    pub layers: BTreeMap<String, Vec<SensitivityPoint>>,
}

impl SensitivityTable {
    /// Per-layer ratio whose interpolated loss equals `max_loss`, skipping `skip`.
    /// Layers that cannot be pruned within the budget are left out.
    pub fn ratios_for_loss(&self, max_loss: f64, skip: &HashSet<String>) -> BTreeMap<String, f64> {
        self.layers
            .iter()
            .filter(|(name, _)| !skip.contains(*name))
            .map(|(name, points)| (name.clone(), ratio_for_loss(points, max_loss)))
            .filter(|(_, ratio)| *ratio > 0.0)
            .collect()
    }
}

fn ratio_for_loss(points: &[SensitivityPoint], max_loss: f64) -> f64 {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.ratio.total_cmp(&b.ratio));

    let (mut r0, mut l0) = (0.0, 0.0);
    for p in sorted {
        if p.loss > max_loss {
            if p.loss - l0 <= f64::EPSILON {
                return r0;
            }
            return r0 + (max_loss - l0) * (p.ratio - r0) / (p.loss - l0);
        }
        r0 = p.ratio;
        l0 = p.loss;
    }
    r0
}

/// Linear FLOPs-reduction estimate for a set of per-layer ratios.
pub fn estimated_reduction(
    ratios: &BTreeMap<String, f64>,
    layer_flops: &BTreeMap<String, u64>,
    total_flops: u64,
) -> f64 {
    if total_flops == 0 {
        return 0.0;
    }
    let removed: f64 = ratios
        .iter()
        .map(|(name, ratio)| layer_flops.get(name).copied().unwrap_or(0) as f64 * ratio)
        .sum();
    removed / total_flops as f64
}

/// Bisect on the tolerated loss until the estimated reduction is within tolerance of
/// `target`. Falls back to the smallest loss whose estimate overshoots the target, or to
/// the loosest budget when the target is out of reach.
pub fn search_ratios(
    table: &SensitivityTable,
    layer_flops: &BTreeMap<String, u64>,
    total_flops: u64,
    target: f64,
    skip: &HashSet<String>,
) -> BTreeMap<String, f64> {
    let (mut lo, mut hi) = (0.0, 1.0);
    let mut best = table.ratios_for_loss(hi, skip);
    for _ in 0..MAX_SEARCH_STEPS {
        let mid = (lo + hi) / 2.0;
        let ratios = table.ratios_for_loss(mid, skip);
        let reduction = estimated_reduction(&ratios, layer_flops, total_flops);
        debug!(max_loss = mid, reduction, "Pruning ratio search");
        if (reduction - target).abs() < FLOPS_TOLERANCE {
            return ratios;
        }
        if reduction > target {
            hi = mid;
            best = ratios;
        } else {
            lo = mid;
        }
    }
    best
}

/// Remove the least important filters of every listed parameter.
pub fn apply_ratios(
    net: &mut dyn PrunableNetwork,
    criterion: PruneCriterion,
    ratios: &BTreeMap<String, f64>,
) -> std::result::Result<(), EngineError> {
    for (name, &ratio) in ratios {
        let weight = net.parameter(name)?;
        let filters = least_important(&criterion.importance(&weight), ratio);
        if !filters.is_empty() {
            net.remove_filters(name, &filters)?;
        }
    }
    Ok(())
}

/// Re-create the pruned architecture recorded in `state`, so saved weights fit.
pub fn reapply(net: &mut dyn PrunableNetwork, state: &PruningState) -> Result<()> {
    let criterion = PruneCriterion::from_pruner_name(&state.pruner).ok_or_else(|| {
        ConfigError::invalid(format!("unknown pruner '{}' in prune.yml", state.pruner))
    })?;
    apply_ratios(net, criterion, &state.pruning_ratios)?;
    Ok(())
}

impl<R: ModelRunner> LifecycleController<R> {
    fn prunable(&mut self) -> Result<&mut dyn PrunableNetwork> {
        if !self.config.descriptor().supports_pruning {
            return Err(ConfigError::PruningUnsupported {
                family: self.config.architecture().to_string(),
            }
            .into());
        }
        let family = self.config.architecture().to_string();
        self.net
            .pruning()
            .ok_or_else(|| ConfigError::PruningUnsupported { family }.into())
    }

    /// Measure how much the primary metric drops when each layer is thinned, and write
    /// the table to `save_dir/model.sensi.data`.
    pub fn analyze_sensitivity<D>(
        &mut self,
        dataset: &mut D,
        batch_size: usize,
        criterion: &str,
        save_dir: &Path,
    ) -> Result<SensitivityTable>
    where
        D: Dataset<Batch = R::Batch>,
    {
        self.prunable()?;
        let criterion: PruneCriterion = criterion.parse()?;
        if dataset.num_samples() == 0 {
            return Err(ConfigError::DatasetTooSmall {
                samples: 0,
                batch_size,
            }
            .into());
        }

        dataset.set_transform_mode(RunMode::Eval);
        let inputs = {
            let sample = dataset.sample(0)?;
            let batch = dataset.collate(vec![sample])?;
            self.runner.template_input(&batch)
        };

        info!("Sensitivity analysis of model parameters starts...");
        let baseline = self.evaluate(dataset, batch_size, false)?;
        let (metric, baseline) = primary_metric(&baseline.metrics)
            .map(|(k, v)| (k.to_string(), v))
            .ok_or_else(|| ConfigError::invalid("evaluation produced no metrics"))?;

        let params: Vec<String> = self
            .net
            .parameters()
            .into_iter()
            .filter(|p| p.prunable && p.leading_dim() > 1)
            .map(|p| p.name)
            .collect();

        let mut layers = BTreeMap::new();
        for name in params {
            let original = self.prunable()?.parameter(&name)?;
            let importance = criterion.importance(&original);
            let mut points = Vec::new();
            for ratio in SENSITIVITY_RATIOS {
                let filters = least_important(&importance, ratio);
                if filters.is_empty() {
                    continue;
                }
                self.prunable()?
                    .set_parameter(&name, zero_filters(&original, &filters))?;
                let evaluation = self.evaluate(dataset, batch_size, false);
                if evaluation.is_err() {
                    self.prunable()?.set_parameter(&name, original.clone())?;
                }
                let value = primary_metric(&evaluation?.metrics)
                    .map(|(_, v)| v)
                    .unwrap_or(0.0);
                let loss = if baseline.abs() > f64::EPSILON {
                    (baseline - value) / baseline
                } else {
                    0.0
                };
                debug!(param = %name, ratio, loss, "Sensitivity point");
                points.push(SensitivityPoint { ratio, loss });
            }
            self.prunable()?.set_parameter(&name, original)?;
            layers.insert(name, points);
        }

        let table = SensitivityTable {
            criterion,
            metric,
            baseline,
            inputs,
            layers,
        };
        if self.ctx.is_leader() {
            let path = save_dir.join(SENSITIVITY_FILE);
            atomic_write_json(&path, &table)?;
            info!(
                "Sensitivity analysis is complete. The result is saved at {}.",
                path.display()
            );
        }
        self.sensitivities = Some(table.clone());
        Ok(table)
    }

    /// Use a sensitivity table written by an earlier analysis.
    pub fn load_sensitivities(&mut self, path: &Path) -> Result<()> {
        let table: SensitivityTable =
            load_json(path)?.ok_or(ConfigError::MissingSensitivities)?;
        self.sensitivities = Some(table);
        Ok(())
    }

    /// Remove filters until roughly `pruned_flops` of the FLOPs are gone. The model
    /// becomes `Pruned` and cannot be pruned again.
    pub fn prune(&mut self, pruned_flops: f64, save_dir: Option<&Path>) -> Result<PruningState> {
        if self.status == ModelStatus::Pruned {
            return Err(ConfigError::AlreadyPruned.into());
        }
        if !(pruned_flops > 0.0 && pruned_flops < 1.0) {
            return Err(ConfigError::invalid(format!(
                "pruned_flops must be in (0, 1), got {pruned_flops}"
            ))
            .into());
        }
        self.prunable()?;
        let table = self
            .sensitivities
            .clone()
            .ok_or(ConfigError::MissingSensitivities)?;

        let skip: HashSet<String> = self
            .net
            .parameters()
            .into_iter()
            .filter(|p| !p.prunable || p.leading_dim() <= MIN_PRUNABLE_FILTERS)
            .map(|p| p.name)
            .collect();

        let prunable = self.prunable()?;
        let pre_flops = prunable.flops(&table.inputs)?;
        info!("Pre-pruning FLOPs: {}. Pruning starts...", pre_flops);
        let layer_flops = prunable.layer_flops(&table.inputs)?;
        let ratios = search_ratios(&table, &layer_flops, pre_flops, pruned_flops, &skip);
        apply_ratios(prunable, table.criterion, &ratios)?;
        let post_flops = prunable.flops(&table.inputs)?;
        info!("Pruning is complete. Post-pruning FLOPs: {}", post_flops);
        warn!("Pruning the model may hurt its performance, retraining is highly recommended");

        let state = PruningState {
            pruner: table.criterion.pruner_name().to_string(),
            pruning_ratios: ratios,
            pruner_inputs: table.inputs,
        };
        self.status = ModelStatus::Pruned;
        self.pruning = Some(state.clone());

        if let Some(dir) = save_dir.filter(|_| self.ctx.is_leader()) {
            self.save_model(dir)?;
            info!("Pruned model is saved at {}", dir.display());
        }
        Ok(state)
    }
}
