//! # Kestrel Core
//!
//! Model-lifecycle controller for image-classification networks that live in an
//! external tensor engine. Provides the training loop with data-parallel coordination,
//! evaluation, best-model tracking, early stopping, checkpoint directories, structured
//! pruning and inference export.

pub mod config;
pub mod data;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod pruning;
pub mod registry;
pub mod schedule;
pub mod training;

// Re-export commonly used types at the crate root.
pub use config::{KestrelConfig, LoggingConfig, TrainConfig, load_config};
pub use data::{DataLoader, Dataset, DistributedBatchSampler, EpochAware, build_sampler};
pub use distributed::{DistributedContext, LocalGroup, SingleProcess};
pub use engine::{
    DataParallel, ExportedGraph, InputSpec, NetMode, Network, NoGrad, Optimizer, ParamInfo,
    PrunableNetwork,
};
pub use error::{CheckpointError, ConfigError, EngineError, KestrelError, Result};
pub use metrics::{MetricMap, SmoothedValue, TrainingStats};
pub use pruning::{PruneCriterion, SensitivityTable};
pub use registry::{ArchitectureDescriptor, ClassifierParams, ModelConfig, ModelFamily};
pub use schedule::LrSchedule;
pub use training::{
    ClassifierRunner, Evaluation, ImageBatch, LifecycleController, ModelRunner, ModelStatus,
    RunMode, StopReason, TrainOutcome, TrainingState,
};
