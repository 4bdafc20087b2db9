//! Configuration system for Kestrel.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/kestrel/config.toml` and/or `.kestrel/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Training-run parameters shared by the controller and the default LR schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Total number of epochs, counted from the start of training (not from a resume point).
    pub num_epochs: usize,
    /// Total batch size across all workers.
    pub batch_size: usize,
    /// Evaluation batch size; falls back to `batch_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_batch_size: Option<usize>,
    /// Evaluate and save every N epochs.
    pub save_interval_epochs: usize,
    /// Emit a progress line every N steps.
    pub log_interval_steps: usize,
    pub save_dir: PathBuf,
    /// `IMAGENET`, a weights file path, or `None` to start from scratch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretrain_weights: Option<String>,
    pub learning_rate: f64,
    pub warmup_steps: usize,
    pub warmup_start_lr: f64,
    pub lr_decay_epochs: Vec<usize>,
    pub lr_decay_gamma: f64,
    pub early_stop: bool,
    pub early_stop_patience: usize,
    /// Write scalar time series under `save_dir/vdl_log`.
    pub use_vdl: bool,
    /// Task identifier prefixed to visualization tags.
    pub task_id: String,
    /// Base seed for the shuffling sampler.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 64,
            eval_batch_size: None,
            save_interval_epochs: 1,
            log_interval_steps: 10,
            save_dir: PathBuf::from("output"),
            pretrain_weights: Some("IMAGENET".to_string()),
            learning_rate: 0.025,
            warmup_steps: 0,
            warmup_start_lr: 0.0,
            lr_decay_epochs: vec![30, 60, 90],
            lr_decay_gamma: 0.1,
            early_stop: false,
            early_stop_patience: 5,
            use_vdl: true,
            task_id: String::new(),
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn eval_batch_size(&self) -> usize {
        self.eval_batch_size.unwrap_or(self.batch_size)
    }

    /// Validate the configuration, returning a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.num_epochs == 0 {
            problems.push("train.num_epochs must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            problems.push("train.batch_size must be at least 1".to_string());
        }
        if self.eval_batch_size == Some(0) {
            problems.push("train.eval_batch_size must be at least 1".to_string());
        }
        if self.save_interval_epochs == 0 {
            problems.push("train.save_interval_epochs must be at least 1".to_string());
        }
        if self.log_interval_steps == 0 {
            problems.push("train.log_interval_steps must be at least 1".to_string());
        }
        if self.learning_rate <= 0.0 {
            problems.push(format!(
                "train.learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.lr_decay_epochs.windows(2).any(|w| w[0] >= w[1]) {
            problems.push("train.lr_decay_epochs must be strictly increasing".to_string());
        }
        if self.early_stop && self.early_stop_patience == 0 {
            problems.push("train.early_stop_patience must be at least 1".to_string());
        }
        problems
    }
}

/// Logging output configuration consumed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive for the stderr layer.
    pub level: String,
    /// Directory for the JSON log file; the platform data directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_dir: None,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `KESTREL_`)
/// 3. Workspace-local config (`.kestrel/config.toml`)
/// 4. User config (`~/.config/kestrel/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&KestrelConfig>,
) -> Result<KestrelConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(KestrelConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".kestrel").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // KESTREL_TRAIN__BATCH_SIZE, KESTREL_LOGGING__LEVEL, ...
    figment = figment.merge(Env::prefixed("KESTREL_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Location of the user-level config file, if a home directory can be resolved.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "kestrel", "kestrel")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KestrelConfig::default();
        assert_eq!(config.train.batch_size, 64);
        assert_eq!(config.train.lr_decay_epochs, vec![30, 60, 90]);
        assert_eq!(config.train.pretrain_weights.as_deref(), Some("IMAGENET"));
        assert_eq!(config.train.eval_batch_size(), 64);
        assert_eq!(config.logging.level, "info");
        assert!(config.train.validate().is_empty());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = KestrelConfig::default();
        config.train.num_epochs = 3;
        config.train.eval_batch_size = Some(8);
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: KestrelConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.train.num_epochs, 3);
        assert_eq!(deserialized.train.eval_batch_size(), 8);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: KestrelConfig = toml::from_str("[train]\nnum_epochs = 2\n").unwrap();
        assert_eq!(config.train.num_epochs, 2);
        assert_eq!(config.train.batch_size, 64);
        assert_eq!(config.train.save_dir, PathBuf::from("output"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let config = TrainConfig {
            batch_size: 0,
            save_interval_epochs: 0,
            lr_decay_epochs: vec![10, 5],
            early_stop: true,
            early_stop_patience: 0,
            ..TrainConfig::default()
        };
        let problems = config.validate();
        assert_eq!(problems.len(), 4);
        assert!(problems.iter().any(|p| p.contains("lr_decay_epochs")));
    }

    #[test]
    fn test_load_config_workspace_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir(".kestrel")?;
            jail.create_file(
                ".kestrel/config.toml",
                "[train]\nnum_epochs = 7\nbatch_size = 16\n",
            )?;
            jail.set_env("KESTREL_TRAIN__BATCH_SIZE", "32");
            let config = load_config(Some(jail.directory()), None).unwrap();
            assert_eq!(config.train.num_epochs, 7);
            assert_eq!(config.train.batch_size, 32);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_overrides_win() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("KESTREL_TRAIN__NUM_EPOCHS", "4");
            let mut overrides = KestrelConfig::default();
            overrides.train.num_epochs = 12;
            let config = load_config(None, Some(&overrides)).unwrap();
            assert_eq!(config.train.num_epochs, 12);
            Ok(())
        });
    }
}
