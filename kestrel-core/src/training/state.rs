//! Mutable lifecycle state carried across epochs and checkpoints.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::InputSpec;
use crate::training::callbacks::EarlyStop;

/// Lifecycle status of a model. `Normal -> Pruned` is one-way; `Infer` only appears in
/// exported inference artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    #[default]
    Normal,
    Pruned,
    Infer,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Normal => "Normal",
            ModelStatus::Pruned => "Pruned",
            ModelStatus::Infer => "Infer",
        };
        f.write_str(s)
    }
}

/// Best evaluation result seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMetric {
    pub key: String,
    pub value: f64,
    /// 1-based epoch that produced it.
    pub epoch: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub completed_epochs: usize,
    pub global_step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<BestMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stop: Option<EarlyStop>,
}

impl TrainingState {
    /// Record `value` if it is strictly better than the current best.
    /// Returns whether the best record changed.
    pub fn observe(&mut self, key: &str, value: f64, epoch: usize) -> bool {
        let improved = self.best.as_ref().is_none_or(|b| value > b.value);
        if improved {
            self.best = Some(BestMetric {
                key: key.to_string(),
                value,
                epoch,
            });
        }
        improved
    }
}

/// Pruning information attached to a `Pruned` model, persisted as `prune.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningState {
    pub pruner: String,
    pub pruning_ratios: BTreeMap<String, f64>,
    pub pruner_inputs: Vec<InputSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_is_strict() {
        let mut state = TrainingState::default();
        let seq = [0.5, 0.5, 0.6, 0.4];
        let improved: Vec<bool> = seq
            .iter()
            .enumerate()
            .map(|(i, v)| state.observe("acc1", *v, i + 1))
            .collect();
        assert_eq!(improved, vec![true, false, true, false]);
        let best = state.best.unwrap();
        assert_eq!(best.epoch, 3);
        assert!((best.value - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ModelStatus::Pruned.to_string(), "Pruned");
        assert_eq!(
            serde_yaml::to_string(&ModelStatus::Infer).unwrap().trim(),
            "Infer"
        );
    }
}
