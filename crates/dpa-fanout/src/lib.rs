//! Bounded fan-out for southbound retrieval.
//!
//! Retrieval has to visit every partition of the backend domain (typically
//! one partition per network namespace). Partitions are independent, so they
//! are spread across a bounded set of worker threads; each partition's
//! failure is captured on its own and never aborts the siblings.
//!
//! Worker threads, not async tasks: entering a network namespace pins the
//! calling OS thread, so the unit of parallelism must be a real thread.

mod context;

use std::sync::mpsc;

use serde::{Deserialize, Serialize};

pub use context::{ContextLock, EnteredContext, ScopedContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Upper bound on concurrently running retrieval workers.
    pub max_workers: usize,
    /// Minimum number of partitions one worker should handle before it is
    /// worth spawning another.
    pub min_work_per_worker: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            min_work_per_worker: 3,
        }
    }
}

impl FanoutConfig {
    /// Number of workers used for `partitions` partitions:
    /// `clamp(ceil(partitions / min_work_per_worker), 1, max_workers)`.
    pub fn worker_count(&self, partitions: usize) -> usize {
        let min_work = self.min_work_per_worker.max(1);
        let wanted = partitions.div_ceil(min_work);
        wanted.clamp(1, self.max_workers.max(1))
    }
}

/// Result of probing one partition.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionOutcome<T, E> {
    /// Partition reachable, values listed.
    Retrieved(Vec<T>),
    /// The partition disappeared between listing and probing (e.g. a
    /// namespace was torn down); treated as "now empty", not as a failure.
    Vanished,
    /// The partition was reachable but returned malformed or inconsistent
    /// data; fatal for this partition only.
    Failed(E),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResult<T, E> {
    pub partition: usize,
    pub outcome: PartitionOutcome<T, E>,
}

impl<T, E> PartitionResult<T, E> {
    pub fn values(self) -> Vec<T> {
        match self.outcome {
            PartitionOutcome::Retrieved(values) => values,
            PartitionOutcome::Vanished | PartitionOutcome::Failed(_) => Vec::new(),
        }
    }
}

/// Probes every partition with `retrieve`, running at most
/// [`FanoutConfig::worker_count`] workers concurrently. Workers pick
/// partitions by stride, results are merged and returned ordered by
/// partition index.
pub fn retrieve_partitioned<P, T, E, F>(
    partitions: &[P],
    config: &FanoutConfig,
    retrieve: F,
) -> Vec<PartitionResult<T, E>>
where
    P: Sync,
    T: Send,
    E: Send,
    F: Fn(&P) -> PartitionOutcome<T, E> + Sync,
{
    if partitions.is_empty() {
        return Vec::new();
    }
    let workers = config.worker_count(partitions.len());
    log::debug!(
        "retrieving {} partition(s) with {} worker(s)",
        partitions.len(),
        workers
    );

    let (tx, rx) = mpsc::channel();
    let run_worker = |worker: usize, tx: mpsc::Sender<PartitionResult<T, E>>| {
        for idx in (worker..partitions.len()).step_by(workers) {
            let outcome = retrieve(&partitions[idx]);
            if tx
                .send(PartitionResult {
                    partition: idx,
                    outcome,
                })
                .is_err()
            {
                return;
            }
        }
    };

    std::thread::scope(|scope| {
        for worker in 1..workers {
            let tx = tx.clone();
            let run_worker = &run_worker;
            scope.spawn(move || run_worker(worker, tx));
        }
        run_worker(0, tx);
    });

    let mut results: Vec<_> = rx.into_iter().collect();
    results.sort_by_key(|r| r.partition);
    results
}
