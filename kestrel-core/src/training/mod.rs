//! Training lifecycle: runners, the epoch loop, callbacks, state and checkpoints.

pub mod callbacks;
pub mod checkpoint;
pub mod controller;
pub mod pretrain;
pub mod runner;
pub mod sink;
pub mod state;

pub use callbacks::{CallbackAction, EarlyStop};
pub use checkpoint::{ModelInfo, load_model, save_model, validate_checkpoint};
pub use controller::{Evaluation, LifecycleController, StopReason, TrainOutcome};
pub use pretrain::{PretrainWeights, resolve_pretrain_weights};
pub use runner::{ClassScore, ClassifierRunner, ImageBatch, ModelRunner, RunMode, RunOutput};
pub use sink::{JsonlScalarSink, ScalarSink};
pub use state::{BestMetric, ModelStatus, PruningState, TrainingState};
