//! Dataset contract and the distributed batch loader.
//!
//! A [`DistributedBatchSampler`] shards sample indices across workers (padding so every
//! worker sees the same number of samples) and groups them into per-worker batches;
//! [`DataLoader`] turns those index batches into collated batches by pulling samples from
//! the dataset in order.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::distributed::DistributedContext;
use crate::error::{ConfigError, Result};
use crate::training::runner::RunMode;

/// A finite, indexable source of samples.
pub trait Dataset {
    type Sample;
    type Batch;

    fn num_samples(&self) -> usize;

    fn sample(&self, index: usize) -> Result<Self::Sample>;

    /// Stack samples into one batch.
    fn collate(&self, samples: Vec<Self::Sample>) -> Result<Self::Batch>;

    /// Whether training batches should be drawn in shuffled order.
    fn shuffle(&self) -> bool {
        false
    }

    /// Loader worker-count hint.
    fn num_workers(&self) -> usize {
        0
    }

    /// Class names, indexed by label id.
    fn labels(&self) -> &[String];

    /// Arrange the transform pipeline for a mode (train-time augmentation on or off).
    fn set_transform_mode(&mut self, _mode: RunMode) {}

    /// Description of the transform pipeline, recorded in model metadata.
    fn transforms(&self) -> Vec<serde_yaml::Value> {
        Vec::new()
    }

    /// Epoch-aware capability for deterministic but varying shuffling.
    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        None
    }
}

pub trait EpochAware {
    fn set_epoch(&mut self, epoch: usize);
}

/// Split a total batch size evenly across workers.
pub fn per_worker_batch_size(batch_size: usize, world_size: usize) -> Result<usize> {
    let world_size = world_size.max(1);
    if batch_size == 0 || batch_size % world_size != 0 {
        return Err(ConfigError::UnevenBatchSize {
            batch_size,
            world_size,
        }
        .into());
    }
    Ok(batch_size / world_size)
}

/// Sharded index sampler.
#[derive(Debug, Clone)]
pub struct DistributedBatchSampler {
    num_samples: usize,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedBatchSampler {
    pub fn new(
        num_samples: usize,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Self {
        Self {
            num_samples,
            batch_size: batch_size.max(1),
            rank,
            world_size: world_size.max(1),
            shuffle,
            drop_last,
            seed: 0,
            epoch: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Samples assigned to this worker after padding.
    pub fn samples_per_worker(&self) -> usize {
        self.num_samples.div_ceil(self.world_size)
    }

    /// Number of batches this worker will produce.
    pub fn len(&self) -> usize {
        let per_worker = self.samples_per_worker();
        if self.drop_last {
            per_worker / self.batch_size
        } else {
            per_worker.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This worker's index batches for the current epoch.
    pub fn batches(&self) -> Vec<Vec<usize>> {
        if self.num_samples == 0 {
            return Vec::new();
        }
        let mut indices: Vec<usize> = (0..self.num_samples).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }
        let total = self.samples_per_worker() * self.world_size;
        let padded: Vec<usize> = indices.iter().copied().cycle().take(total).collect();
        let local: Vec<usize> = padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect();

        local
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

/// Iterator of collated batches for one pass over a dataset.
pub struct DataLoader<'a, D: Dataset> {
    dataset: &'a D,
    batches: std::vec::IntoIter<Vec<usize>>,
    steps: usize,
}

impl<'a, D: Dataset> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, sampler: &DistributedBatchSampler) -> Self {
        let batches = sampler.batches();
        let steps = batches.len();
        Self {
            dataset,
            batches: batches.into_iter(),
            steps,
        }
    }

    /// Total batches in this pass, including ones already yielded.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl<D: Dataset> Iterator for DataLoader<'_, D> {
    type Item = Result<D::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        let samples: Result<Vec<D::Sample>> =
            indices.iter().map(|&i| self.dataset.sample(i)).collect();
        Some(samples.and_then(|s| self.dataset.collate(s)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

/// Build the sampler for `mode`, enforcing the batch-size preconditions.
///
/// `batch_size` is the total across workers. Training shuffles (when the dataset asks
/// for it) and drops the trailing partial batch; evaluation does neither.
pub fn build_sampler<D: Dataset>(
    dataset: &D,
    batch_size: usize,
    mode: RunMode,
    ctx: &dyn DistributedContext,
    seed: u64,
) -> Result<DistributedBatchSampler> {
    let per_worker = per_worker_batch_size(batch_size, ctx.world_size())?;
    let checked_batch = if mode == RunMode::Train {
        batch_size
    } else {
        per_worker
    };
    let num_samples = dataset.num_samples();
    if num_samples < checked_batch {
        return Err(ConfigError::DatasetTooSmall {
            samples: num_samples,
            batch_size: checked_batch,
        }
        .into());
    }

    let training = mode == RunMode::Train;
    let sampler = DistributedBatchSampler::new(
        num_samples,
        per_worker,
        ctx.rank(),
        ctx.world_size(),
        training && dataset.shuffle(),
        training,
    )
    .with_seed(seed);

    if training {
        debug!(
            samples = num_samples,
            per_worker_batch = per_worker,
            workers = dataset.num_workers(),
            "Built training sampler"
        );
    } else {
        info!(
            "Start to evaluate(total_samples={}, total_steps={})...",
            num_samples,
            num_samples.div_ceil(per_worker)
        );
    }
    Ok(sampler)
}
