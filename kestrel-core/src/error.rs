//! Error types for the Kestrel lifecycle core.
//!
//! Uses `thiserror` for public API error types with structured variants covering
//! configuration, checkpoint and engine domains. Configuration errors are fatal and
//! surface before any expensive work starts; engine errors are passed through untouched.

use std::path::PathBuf;

/// Top-level error type for the Kestrel core library.
#[derive(Debug, thiserror::Error)]
pub enum KestrelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Fatal configuration problems. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The volume of dataset ({samples}) must be larger than batch size ({batch_size})")]
    DatasetTooSmall { samples: usize, batch_size: usize },

    #[error("Batch size {batch_size} cannot be split evenly across {world_size} workers")]
    UnevenBatchSize {
        batch_size: usize,
        world_size: usize,
    },

    #[error("There's no model named {name}")]
    UnsupportedArchitecture { name: String },

    #[error("Unknown parameter '{key}' for architecture {architecture}")]
    UnknownParameter { architecture: String, key: String },

    #[error("Pruning criterion {criterion} is not supported, choose from [l1_norm, fpgm]")]
    UnsupportedCriterion { criterion: String },

    #[error("A pruned model cannot be pruned again")]
    AlreadyPruned,

    #[error("{family} does not support pruning currently")]
    PruningUnsupported { family: String },

    #[error("Sensitivity analysis must run before pruning")]
    MissingSensitivities,

    #[error("Argument patience should be a positive integer, got {patience}")]
    InvalidPatience { patience: usize },

    #[error("Labels are not bound; train or load the model first")]
    LabelsUnbound,

    #[error("No optimizer is attached to the model")]
    MissingOptimizer,

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors from reading checkpoint directories.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint directory not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Checkpoint at {path} is incomplete (missing success marker)")]
    Incomplete { path: PathBuf },

    #[error("Checkpoint at {path} is missing {file}")]
    MissingFile { path: PathBuf, file: String },

    #[error("Invalid checkpoint metadata in {path}: {message}")]
    InvalidMetadata { path: PathBuf, message: String },
}

/// Failure reported by the external numeric engine.
///
/// The controller never catches these; they reach the caller as
/// [`KestrelError::Engine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Forward pass failed: {message}")]
    Forward { message: String },

    #[error("Backward pass failed: {message}")]
    Backward { message: String },

    #[error("Optimizer step failed: {message}")]
    Optimizer { message: String },

    #[error("State dict error: {message}")]
    State { message: String },

    #[error("Collective communication failed: {message}")]
    Collective { message: String },

    #[error("Export failed: {message}")]
    Export { message: String },

    #[error("Operation not supported by engine: {operation}")]
    Unsupported { operation: String },
}

impl EngineError {
    pub fn forward(msg: impl Into<String>) -> Self {
        Self::Forward {
            message: msg.into(),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State {
            message: msg.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid {
            message: msg.into(),
        }
    }
}

/// A type alias for results using the top-level `KestrelError`.
pub type Result<T> = std::result::Result<T, KestrelError>;
