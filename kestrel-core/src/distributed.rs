//! Collective-communication context for data-parallel training.
//!
//! The controller receives one [`DistributedContext`] at construction and never queries
//! ambient process state for rank or world size. `SingleProcess` is the trivial group;
//! `LocalGroup` runs N in-process workers on threads and is used for simulation and tests.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::EngineError;
use crate::metrics::MetricMap;

/// Rank/world-size view plus the collectives the lifecycle needs.
///
/// Every worker in the group must issue the same sequence of collective calls; a worker
/// that skips one stalls the others.
pub trait DistributedContext: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sum `value` across all workers. Blocks until every worker has contributed.
    fn all_reduce_sum(&self, value: f64) -> Result<f64, EngineError>;

    /// Block until every worker reaches this point.
    fn barrier(&self) -> Result<(), EngineError>;

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    fn is_leader(&self) -> bool {
        self.rank() == 0
    }
}

/// Average one scalar across workers (sum, then divide by world size).
pub fn all_reduce_mean(ctx: &dyn DistributedContext, value: f64) -> Result<f64, EngineError> {
    if !ctx.is_distributed() {
        return Ok(value);
    }
    Ok(ctx.all_reduce_sum(value)? / ctx.world_size() as f64)
}

/// Average every metric in place. Keys are reduced in mapping order, so all workers must
/// hold the same keys in the same order.
pub fn all_reduce_metrics(
    ctx: &dyn DistributedContext,
    metrics: &mut MetricMap,
) -> Result<(), EngineError> {
    if !ctx.is_distributed() {
        return Ok(());
    }
    for value in metrics.values_mut() {
        *value = all_reduce_mean(ctx, *value)?;
    }
    Ok(())
}

/// A group of exactly one worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl DistributedContext for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, EngineError> {
        Ok(value)
    }

    fn barrier(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct GroupShared {
    slots: Mutex<Vec<f64>>,
    barrier: Barrier,
}

/// One worker of an in-process, thread-backed collective group.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<GroupShared>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl LocalGroup {
    /// Create `world_size` connected workers, one per rank. Each must be driven from
    /// its own thread once collectives are involved.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(GroupShared {
            slots: Mutex::new(vec![0.0; world_size]),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<f64>>, EngineError> {
        self.shared.slots.lock().map_err(|_| EngineError::Collective {
            message: "a peer worker panicked during a collective".to_string(),
        })
    }
}

impl DistributedContext for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, EngineError> {
        self.slots()?[self.rank] = value;
        self.shared.barrier.wait();
        let sum = self.slots()?.iter().sum();
        // Second phase keeps a fast worker from overwriting its slot before peers read it.
        self.shared.barrier.wait();
        Ok(sum)
    }

    fn barrier(&self) -> Result<(), EngineError> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_is_identity() {
        let ctx = SingleProcess;
        assert!(!ctx.is_distributed());
        assert!(ctx.is_leader());
        assert_eq!(all_reduce_mean(&ctx, 0.75).unwrap(), 0.75);
    }

    #[test]
    fn test_local_group_sum_and_mean() {
        let workers = LocalGroup::new(4);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    let sum = w.all_reduce_sum(w.rank() as f64).unwrap();
                    let mean = all_reduce_mean(&w, w.rank() as f64).unwrap();
                    (sum, mean)
                })
            })
            .collect();
        for h in handles {
            let (sum, mean) = h.join().unwrap();
            assert_eq!(sum, 6.0);
            assert_eq!(mean, 1.5);
        }
    }

    #[test]
    fn test_reduce_metrics_agreeing_workers_is_noop() {
        let workers = LocalGroup::new(3);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    let mut m = MetricMap::new();
                    m.insert("acc1".into(), 0.625);
                    m.insert("acc5".into(), 0.875);
                    all_reduce_metrics(&w, &mut m).unwrap();
                    m
                })
            })
            .collect();
        for h in handles {
            let m = h.join().unwrap();
            assert!((m["acc1"] - 0.625).abs() < 1e-12);
            assert!((m["acc5"] - 0.875).abs() < 1e-12);
        }
    }

    #[test]
    fn test_repeated_collectives_stay_in_lockstep() {
        let workers = LocalGroup::new(2);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    (0..50)
                        .map(|i| w.all_reduce_sum(i as f64 + w.rank() as f64).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for h in handles {
            let sums = h.join().unwrap();
            for (i, s) in sums.iter().enumerate() {
                assert_eq!(*s, 2.0 * i as f64 + 1.0);
            }
        }
    }
}
