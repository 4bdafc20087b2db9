//! Learning-rate schedules indexed by global step.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::TrainConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    Constant {
        lr: f64,
    },
    /// `values[i]` applies until step `boundaries[i]`; the last value applies after.
    PiecewiseDecay {
        boundaries: Vec<usize>,
        values: Vec<f64>,
    },
    /// Linear ramp from `start_lr` to `end_lr` over `warmup_steps`, then `inner`.
    LinearWarmup {
        inner: Box<LrSchedule>,
        warmup_steps: usize,
        start_lr: f64,
        end_lr: f64,
    },
}

impl LrSchedule {
    /// Learning rate for the step with index `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        match self {
            LrSchedule::Constant { lr } => *lr,
            LrSchedule::PiecewiseDecay { boundaries, values } => {
                let idx = boundaries.iter().take_while(|&&b| step >= b).count();
                values
                    .get(idx)
                    .or_else(|| values.last())
                    .copied()
                    .unwrap_or(0.0)
            }
            LrSchedule::LinearWarmup {
                inner,
                warmup_steps,
                start_lr,
                end_lr,
            } => {
                if step < *warmup_steps {
                    start_lr + (end_lr - start_lr) * step as f64 / *warmup_steps as f64
                } else {
                    inner.lr_at(step)
                }
            }
        }
    }

    /// Piecewise decay at every `lr_decay_epochs` boundary, values `lr * gamma^i`, with
    /// an optional linear warm-up in front.
    pub fn default_for(config: &TrainConfig, steps_per_epoch: usize) -> Self {
        let boundaries: Vec<usize> = config
            .lr_decay_epochs
            .iter()
            .map(|e| e * steps_per_epoch)
            .collect();
        let values: Vec<f64> = (0..=boundaries.len())
            .map(|i| config.learning_rate * config.lr_decay_gamma.powi(i as i32))
            .collect();
        let decay = LrSchedule::PiecewiseDecay {
            boundaries: boundaries.clone(),
            values,
        };

        if config.warmup_steps == 0 {
            return decay;
        }
        if let Some(&first) = boundaries.first() {
            if config.warmup_steps > first {
                error!(
                    "Training parameters should satisfy: warmup_steps <= \
                     lr_decay_epochs[0] * steps_per_epoch"
                );
                error!(
                    "warmup_steps should be less than {} or lr_decay_epochs[0] greater than {}, \
                     please modify 'lr_decay_epochs' or 'warmup_steps' in train function",
                    first,
                    config.warmup_steps.div_ceil(steps_per_epoch.max(1))
                );
            }
        }
        LrSchedule::LinearWarmup {
            inner: Box::new(decay),
            warmup_steps: config.warmup_steps,
            start_lr: config.warmup_start_lr,
            end_lr: config.learning_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_config() -> TrainConfig {
        TrainConfig {
            learning_rate: 0.1,
            lr_decay_epochs: vec![2, 4],
            lr_decay_gamma: 0.1,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_piecewise_boundaries() {
        let s = LrSchedule::default_for(&train_config(), 10);
        assert!((s.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((s.lr_at(19) - 0.1).abs() < 1e-12);
        assert!((s.lr_at(20) - 0.01).abs() < 1e-12);
        assert!((s.lr_at(40) - 0.001).abs() < 1e-12);
        assert!((s.lr_at(10_000) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_ramp() {
        let cfg = TrainConfig {
            warmup_steps: 4,
            warmup_start_lr: 0.0,
            ..train_config()
        };
        let s = LrSchedule::default_for(&cfg, 10);
        assert!(matches!(s, LrSchedule::LinearWarmup { .. }));
        assert!((s.lr_at(0) - 0.0).abs() < 1e-12);
        assert!((s.lr_at(2) - 0.05).abs() < 1e-12);
        assert!((s.lr_at(4) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_past_first_boundary_still_builds() {
        let cfg = TrainConfig {
            warmup_steps: 50,
            ..train_config()
        };
        let s = LrSchedule::default_for(&cfg, 10);
        assert!((s.lr_at(60) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_constant() {
        assert_eq!(LrSchedule::Constant { lr: 0.5 }.lr_at(123), 0.5);
    }
}
