//! The lifecycle controller: epoch loop, evaluation, checkpoints and export.
//!
//! One controller drives one network on one worker. In a data-parallel group every
//! worker runs its own controller with a shared [`DistributedContext`]; only rank 0 logs
//! progress and writes artifacts, but every rank takes the same best-model and
//! early-stop decisions because they all see the same reduced metrics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::TrainConfig;
use crate::data::{DataLoader, Dataset, build_sampler, per_worker_batch_size};
use crate::distributed::{DistributedContext, all_reduce_metrics};
use crate::engine::{DataParallel, NetMode, Network, NoGrad, Optimizer};
use crate::error::{ConfigError, EngineError, Result};
use crate::metrics::{MetricMap, SmoothedValue, TrainingStats, format_metrics, primary_metric};
use crate::pruning::SensitivityTable;
use crate::registry::ModelConfig;
use crate::schedule::LrSchedule;
use crate::training::callbacks::{CallbackAction, EarlyStop};
use crate::training::checkpoint::{self, ArtifactMeta, EvalDetails};
use crate::training::pretrain::{IMAGENET, PretrainWeights, resolve_pretrain_weights};
use crate::training::runner::{ClassScore, ClassifierRunner, ImageBatch, ModelRunner, RunMode, RunOutput};
use crate::training::sink::{JsonlScalarSink, ScalarSink, training_tag};
use crate::training::state::{BestMetric, ModelStatus, PruningState, TrainingState};

/// Why the epoch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    EarlyStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub stop_reason: StopReason,
    /// Epochs run by this call, not counting epochs restored from a checkpoint.
    pub epochs_run: usize,
    pub best: Option<BestMetric>,
}

/// Result of one evaluation pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Averaged metrics; the first key is the primary metric.
    pub metrics: MetricMap,
    /// Raw per-batch predictions when requested.
    pub details: Option<EvalDetails>,
}

/// Inputs to the remaining-time heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtaInputs {
    pub avg_step_secs: f64,
    pub remaining_steps: usize,
    /// Batches in one evaluation pass; `None` when there is no eval set.
    pub eval_steps: Option<usize>,
    pub last_eval_secs: Option<f64>,
    pub remaining_evals: usize,
}

/// Estimated seconds left in the run. Never negative.
///
/// Before any evaluation has been timed, one evaluation pass is costed at the average
/// step time per eval batch. Afterwards the last measured pass is charged once for each
/// remaining evaluation.
pub fn estimate_eta(inputs: &EtaInputs) -> f64 {
    let mut eta = inputs.avg_step_secs * inputs.remaining_steps as f64;
    if let Some(eval_steps) = inputs.eval_steps {
        eta += match inputs.last_eval_secs {
            None => inputs.avg_step_secs * eval_steps as f64,
            Some(secs) => secs * inputs.remaining_evals as f64,
        };
    }
    eta.max(0.0)
}

/// `H:MM:SS`
pub fn format_hms(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

pub struct LifecycleController<R: ModelRunner> {
    pub(crate) config: ModelConfig,
    pub(crate) runner: R,
    pub(crate) net: Box<dyn Network>,
    pub(crate) optimizer: Option<Box<dyn Optimizer>>,
    schedule: Option<LrSchedule>,
    pub(crate) ctx: Arc<dyn DistributedContext>,
    sink: Option<Box<dyn ScalarSink>>,
    pub(crate) state: TrainingState,
    pub(crate) status: ModelStatus,
    eval_metrics: Option<MetricMap>,
    eval_details: Option<EvalDetails>,
    pub(crate) pruning: Option<PruningState>,
    pub(crate) sensitivities: Option<SensitivityTable>,
    transforms: Vec<serde_yaml::Value>,
}

impl<R: ModelRunner> LifecycleController<R> {
    pub fn new(
        config: ModelConfig,
        runner: R,
        net: Box<dyn Network>,
        ctx: Arc<dyn DistributedContext>,
    ) -> Self {
        Self {
            config,
            runner,
            net,
            optimizer: None,
            schedule: None,
            ctx,
            sink: None,
            state: TrainingState::default(),
            status: ModelStatus::Normal,
            eval_metrics: None,
            eval_details: None,
            pruning: None,
            sensitivities: None,
            transforms: Vec::new(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Use `schedule` instead of the default piecewise decay.
    pub fn with_schedule(mut self, schedule: LrSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Send training scalars to `sink` instead of the default JSONL file.
    pub fn with_sink(mut self, sink: Box<dyn ScalarSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn pruning_state(&self) -> Option<&PruningState> {
        self.pruning.as_ref()
    }

    /// Metrics from the most recent evaluation inside the training loop.
    pub fn eval_metrics(&self) -> Option<&MetricMap> {
        self.eval_metrics.as_ref()
    }

    pub fn network(&self) -> &dyn Network {
        self.net.as_ref()
    }

    pub fn network_mut(&mut self) -> &mut dyn Network {
        self.net.as_mut()
    }

    /// Bind labels, build the default schedule, load initial weights and run the loop.
    ///
    /// Weights are only initialised for a fresh model; a controller restored with
    /// [`LifecycleController::resume_from`] keeps its weights.
    pub fn train<D, E>(
        &mut self,
        train_set: &mut D,
        eval_set: Option<&mut E>,
        options: &TrainConfig,
    ) -> Result<TrainOutcome>
    where
        D: Dataset<Batch = R::Batch>,
        E: Dataset<Batch = R::Batch>,
    {
        self.check_train_preconditions(&*train_set, options)?;
        self.config.bind_labels(train_set.labels().to_vec());

        if self.schedule.is_none() {
            let steps_per_epoch = (train_set.num_samples() / options.batch_size.max(1)).max(1);
            self.schedule = Some(LrSchedule::default_for(options, steps_per_epoch));
        }

        if self.state.completed_epochs == 0 {
            let weights = resolve_pretrain_weights(options.pretrain_weights.as_deref());
            self.initialize_weights(weights.as_ref())?;
        } else {
            info!(
                "Resuming after {} completed epochs, pretrained weights are not reloaded",
                self.state.completed_epochs
            );
        }

        self.train_loop(train_set, eval_set, options)
    }

    /// Load initial weights from a pretrained source. `None` keeps the engine's init.
    pub fn initialize_weights(&mut self, weights: Option<&PretrainWeights>) -> Result<()> {
        match weights {
            None => {}
            Some(PretrainWeights::Imagenet) => {
                info!("Loading pretrained model from {}", IMAGENET);
                self.net.load_pretrained(IMAGENET)?;
            }
            Some(PretrainWeights::Path(path)) => {
                info!("Loading pretrained model from {}", path.display());
                let bytes = std::fs::read(path)?;
                self.net.load_state_dict(&bytes)?;
            }
        }
        Ok(())
    }

    /// Options, optimizer and dataset size, checked before labels are bound or any
    /// weights are loaded.
    fn check_train_preconditions<D: Dataset>(
        &self,
        train_set: &D,
        options: &TrainConfig,
    ) -> Result<()> {
        let problems = options.validate();
        if !problems.is_empty() {
            return Err(ConfigError::invalid(problems.join("; ")).into());
        }
        if self.optimizer.is_none() {
            return Err(ConfigError::MissingOptimizer.into());
        }
        per_worker_batch_size(options.batch_size, self.ctx.world_size())?;
        if train_set.num_samples() < options.batch_size {
            return Err(ConfigError::DatasetTooSmall {
                samples: train_set.num_samples(),
                batch_size: options.batch_size,
            }
            .into());
        }
        Ok(())
    }

    /// Run epochs `completed_epochs .. num_epochs`.
    pub fn train_loop<D, E>(
        &mut self,
        train_set: &mut D,
        mut eval_set: Option<&mut E>,
        options: &TrainConfig,
    ) -> Result<TrainOutcome>
    where
        D: Dataset<Batch = R::Batch>,
        E: Dataset<Batch = R::Batch>,
    {
        self.check_train_preconditions(&*train_set, options)?;
        if options.early_stop {
            self.state.early_stop = Some(match self.state.early_stop.take() {
                Some(restored) => restored.with_patience(options.early_stop_patience)?,
                None => EarlyStop::new(options.early_stop_patience)?,
            });
        }

        let ctx = Arc::clone(&self.ctx);
        let leader = ctx.is_leader();

        train_set.set_transform_mode(RunMode::Train);
        let mut sampler = build_sampler(
            &*train_set,
            options.batch_size,
            RunMode::Train,
            ctx.as_ref(),
            options.seed,
        )?;

        if let Some(eval_set) = eval_set.as_deref() {
            self.transforms = eval_set.transforms();
        }
        if options.use_vdl && leader && self.sink.is_none() {
            self.sink = Some(Box::new(JsonlScalarSink::create(
                &options.save_dir.join("vdl_log"),
            )?));
        }
        if let (Some(schedule), Some(optimizer)) = (&self.schedule, self.optimizer.as_mut()) {
            optimizer.set_learning_rate(schedule.lr_at(self.state.global_step));
        }

        let num_epochs = options.num_epochs;
        let start_epoch = self.state.completed_epochs;
        let steps_per_epoch = sampler.len();
        let total_steps = steps_per_epoch * num_epochs.saturating_sub(start_epoch);
        let eval_batch_size = options.eval_batch_size();
        let eval_steps = eval_set
            .as_deref()
            .map(|e| e.num_samples().div_ceil(eval_batch_size));

        let mut step_time = SmoothedValue::new(options.log_interval_steps);
        let mut last_eval_secs: Option<f64> = None;
        let mut current_step = 0usize;
        let mut epochs_run = 0usize;
        let mut stop_reason = StopReason::Completed;

        for epoch in start_epoch..num_epochs {
            self.net.set_mode(NetMode::Train);
            if let Some(aware) = train_set.epoch_aware() {
                aware.set_epoch(epoch);
            }
            sampler.set_epoch(epoch);

            let mut epoch_stats = TrainingStats::new();
            let mut tic = Instant::now();
            for (step, batch) in DataLoader::new(&*train_set, &sampler).enumerate() {
                let batch = batch?;
                let (output, lr) = self.train_step(&batch)?;
                epoch_stats.update(&output.metrics);

                let mut step_metrics = output.metrics;
                step_metrics.insert("lr".to_string(), lr);
                step_time.update(tic.elapsed().as_secs_f64());
                tic = Instant::now();
                current_step += 1;

                if self.state.global_step % options.log_interval_steps == 0 && leader {
                    if let Some(sink) = self.sink.as_mut().filter(|_| options.use_vdl) {
                        for (name, value) in &step_metrics {
                            sink.add_scalar(
                                &training_tag(&options.task_id, name),
                                *value,
                                self.state.global_step,
                            )?;
                        }
                    }
                    let avg_step_secs = step_time.avg();
                    let eta = estimate_eta(&EtaInputs {
                        avg_step_secs,
                        remaining_steps: total_steps.saturating_sub(current_step),
                        eval_steps,
                        last_eval_secs,
                        remaining_evals: (num_epochs - epoch - 1)
                            .div_ceil(options.save_interval_epochs),
                    });
                    info!(
                        "[TRAIN] Epoch={}/{}, Step={}/{}, {}, time_each_step={:.2}s, eta={}",
                        epoch + 1,
                        num_epochs,
                        step + 1,
                        steps_per_epoch,
                        format_metrics(&step_metrics),
                        avg_step_secs,
                        format_hms(eta)
                    );
                }
            }

            if leader {
                info!("[TRAIN] Epoch {} finished, {} .", epoch + 1, epoch_stats.log());
            }
            self.state.completed_epochs += 1;
            epochs_run += 1;

            let is_save_epoch =
                (epoch + 1) % options.save_interval_epochs == 0 || epoch + 1 == num_epochs;
            if !is_save_epoch {
                continue;
            }

            let eval_tic = Instant::now();
            let mut improved = false;
            let mut stop = false;
            if let Some(eval_set) = eval_set.as_deref_mut().filter(|e| e.num_samples() > 0) {
                let evaluation = self.evaluate(eval_set, eval_batch_size, false)?;
                if leader {
                    info!(
                        "[EVAL] Finished, Epoch={}, {} .",
                        epoch + 1,
                        format_metrics(&evaluation.metrics)
                    );
                }
                if let Some((key, value)) = primary_metric(&evaluation.metrics) {
                    let key = key.to_string();
                    improved = self.state.observe(&key, value, epoch + 1);
                    if let Some(early_stop) =
                        self.state.early_stop.as_mut().filter(|_| options.early_stop)
                    {
                        stop = early_stop.on_eval(value) == CallbackAction::Stop;
                    }
                }
                self.eval_metrics = Some(evaluation.metrics);
                last_eval_secs = Some(eval_tic.elapsed().as_secs_f64());
            }

            if leader {
                if improved {
                    self.save_model(&options.save_dir.join("best_model"))?;
                }
                if let Some(best) = &self.state.best {
                    info!(
                        "Current evaluated best model in eval_dataset is epoch_{}, {}={}",
                        best.epoch, best.key, best.value
                    );
                }
                self.save_model(&options.save_dir.join(format!("epoch_{}", epoch + 1)))?;
            }

            if stop {
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        Ok(TrainOutcome {
            stop_reason,
            epochs_run,
            best: self.state.best.clone(),
        })
    }

    /// Forward, backward, gradient sync, optimizer step and schedule advance for one
    /// batch. Returns the runner output and the learning rate the step used.
    fn train_step(&mut self, batch: &R::Batch) -> Result<(RunOutput, f64)> {
        let optimizer = self
            .optimizer
            .as_deref_mut()
            .ok_or(ConfigError::MissingOptimizer)?;
        let net = self.net.as_mut();

        let output = if self.ctx.is_distributed() {
            let mut ddp = DataParallel::new(&mut *net, self.ctx.as_ref());
            let output = self.runner.run(&mut ddp, batch, RunMode::Train)?;
            ddp.backward()?;
            output
        } else {
            let output = self.runner.run(&mut *net, batch, RunMode::Train)?;
            net.backward()?;
            output
        };

        optimizer.step(&mut *net)?;
        optimizer.clear_grad(&mut *net);
        let lr = optimizer.learning_rate();

        self.state.global_step += 1;
        if let Some(schedule) = &self.schedule {
            optimizer.set_learning_rate(schedule.lr_at(self.state.global_step));
        }
        Ok((output, lr))
    }

    /// Evaluate on `eval_set` without tracking gradients. Does not touch training state.
    pub fn evaluate<E>(
        &mut self,
        eval_set: &mut E,
        batch_size: usize,
        return_details: bool,
    ) -> Result<Evaluation>
    where
        E: Dataset<Batch = R::Batch>,
    {
        eval_set.set_transform_mode(RunMode::Eval);
        let sampler = build_sampler(
            &*eval_set,
            batch_size,
            RunMode::Eval,
            self.ctx.as_ref(),
            0,
        )?;
        self.net.set_mode(NetMode::Eval);

        let mut stats = TrainingStats::new();
        let mut details: Option<EvalDetails> = return_details.then(Vec::new);
        {
            let mut net = NoGrad::new(self.net.as_mut());
            for batch in DataLoader::new(&*eval_set, &sampler) {
                let batch = batch?;
                let mut output = self.runner.run(&mut *net, &batch, RunMode::Eval)?;
                all_reduce_metrics(self.ctx.as_ref(), &mut output.metrics)?;
                stats.update(&output.metrics);
                if let (Some(details), Some(prediction)) = (details.as_mut(), output.prediction) {
                    details.push(prediction);
                }
            }
        }

        if return_details {
            self.eval_details = details.clone();
        }
        Ok(Evaluation {
            metrics: stats.get(),
            details,
        })
    }

    /// Write a checkpoint directory for the current model.
    pub fn save_model(&self, dir: &Path) -> Result<()> {
        let meta = ArtifactMeta {
            config: &self.config,
            status: self.status,
            state: &self.state,
            eval_metrics: self.eval_metrics.as_ref(),
            eval_details: self.eval_details.as_ref(),
            pruning: self.pruning.as_ref(),
            transforms: &self.transforms,
        };
        checkpoint::save_model(dir, self.net.as_ref(), self.optimizer.as_deref(), &meta)
    }

    /// Restore weights, optimizer state, labels, status, pruning and training state.
    pub fn resume_from(&mut self, dir: &Path) -> Result<()> {
        let loaded = checkpoint::load_model(dir)?;
        let info = loaded.info;
        if info.model != self.config.architecture() {
            return Err(ConfigError::invalid(format!(
                "checkpoint at {} holds a {} model, expected {}",
                dir.display(),
                info.model,
                self.config.architecture()
            ))
            .into());
        }
        let saved_classes = info.model_config()?.num_classes();
        if saved_classes != self.config.num_classes() {
            return Err(ConfigError::invalid(format!(
                "checkpoint at {} has {} classes, expected {}",
                dir.display(),
                saved_classes,
                self.config.num_classes()
            ))
            .into());
        }

        if let Some(pruning) = &loaded.pruning {
            let prunable = self
                .net
                .pruning()
                .ok_or_else(|| ConfigError::PruningUnsupported {
                    family: self.config.architecture().to_string(),
                })?;
            crate::pruning::reapply(prunable, pruning)?;
        }
        self.net.load_state_dict(&loaded.params)?;

        match (loaded.optimizer, self.optimizer.as_mut()) {
            (Some(bytes), Some(optimizer)) => optimizer.load_state_dict(&bytes)?,
            (None, Some(_)) => warn!(
                "No optimizer state in {}, optimizer starts fresh",
                dir.display()
            ),
            _ => {}
        }

        if let Some(labels) = info.attributes.labels {
            self.config.bind_labels(labels);
        }
        self.status = info.status;
        self.pruning = loaded.pruning;
        self.state = info.training_state.unwrap_or_else(|| TrainingState {
            completed_epochs: info.completed_epochs,
            ..TrainingState::default()
        });
        if !info.attributes.eval_metrics.is_empty() {
            self.eval_metrics = Some(info.attributes.eval_metrics);
        }
        info!(
            "Resumed from {} (completed_epochs={}, status={})",
            dir.display(),
            self.state.completed_epochs,
            self.status
        );
        Ok(())
    }

    /// Trace the network and write `save_dir/inference_model`. Only rank 0 writes;
    /// other ranks return the directory rank 0 writes to.
    pub fn export_inference_model(
        &mut self,
        save_dir: &Path,
        image_shape: Option<[usize; 2]>,
    ) -> Result<PathBuf> {
        if !self.ctx.is_leader() {
            return Ok(save_dir.join(checkpoint::INFERENCE_DIR));
        }
        self.net.set_mode(NetMode::Eval);
        let inputs = self.runner.input_spec(image_shape);
        let meta = ArtifactMeta {
            config: &self.config,
            status: self.status,
            state: &self.state,
            eval_metrics: self.eval_metrics.as_ref(),
            eval_details: None,
            pruning: self.pruning.as_ref(),
            transforms: &self.transforms,
        };
        checkpoint::export_inference_model(save_dir, self.net.as_mut(), &inputs, &meta)
    }
}

impl LifecycleController<ClassifierRunner> {
    /// Controller for an image classifier described by `config`.
    pub fn classifier(
        config: ModelConfig,
        net: Box<dyn Network>,
        ctx: Arc<dyn DistributedContext>,
    ) -> Self {
        let runner = ClassifierRunner::new(&config);
        Self::new(config, runner, net, ctx)
    }

    /// Top-`topk` labelled scores for every image in `batch`.
    pub fn predict(&mut self, batch: &ImageBatch, topk: usize) -> Result<Vec<Vec<ClassScore>>> {
        let labels = self
            .config
            .labels()
            .ok_or(ConfigError::LabelsUnbound)?
            .to_vec();
        self.net.set_mode(NetMode::Eval);
        let output = {
            let mut net = NoGrad::new(self.net.as_mut());
            self.runner.run(&mut *net, batch, RunMode::Test)?
        };
        let probs = output
            .prediction
            .ok_or_else(|| EngineError::forward("runner returned no prediction"))?;
        ClassifierRunner::postprocess(&probs, &labels, topk)
    }
}
