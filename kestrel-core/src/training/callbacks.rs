//! Training callbacks: early stopping on the primary evaluation metric.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Early stopping on a higher-is-better score.
///
/// A new running maximum always resets the counter. Otherwise a score that drops, or
/// stays within `thresh` of the previous score, counts against `patience`; any other
/// movement resets the counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    patience: usize,
    thresh: f64,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    max: f64,
    #[serde(default)]
    counter: usize,
}

impl EarlyStop {
    pub const DEFAULT_THRESH: f64 = 1e-4;

    pub fn new(patience: usize) -> Result<Self, ConfigError> {
        Self::with_thresh(patience, Self::DEFAULT_THRESH)
    }

    pub fn with_thresh(patience: usize, thresh: f64) -> Result<Self, ConfigError> {
        if patience < 1 {
            return Err(ConfigError::InvalidPatience { patience });
        }
        Ok(Self {
            patience,
            thresh,
            score: None,
            max: 0.0,
            counter: 0,
        })
    }

    /// Same tracked scores and counter, new patience.
    pub fn with_patience(self, patience: usize) -> Result<Self, ConfigError> {
        if patience < 1 {
            return Err(ConfigError::InvalidPatience { patience });
        }
        Ok(Self { patience, ..self })
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Feed one evaluation score.
    pub fn on_eval(&mut self, current: f64) -> CallbackAction {
        let Some(score) = self.score else {
            self.score = Some(current);
            return CallbackAction::Continue;
        };
        if current > self.max {
            self.counter = 0;
            self.score = Some(current);
            self.max = current;
            return CallbackAction::Continue;
        }
        if (score - current).abs() < self.thresh || current < score {
            self.counter += 1;
            self.score = Some(current);
            info!("EarlyStopping: {} / {}", self.counter, self.patience);
            if self.counter >= self.patience {
                info!("EarlyStopping: Stopped");
                return CallbackAction::Stop;
            }
            CallbackAction::Continue
        } else {
            self.counter = 0;
            self.score = Some(current);
            CallbackAction::Continue
        }
    }
}
