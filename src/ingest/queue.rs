use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::IngestTask;
use crate::db::RootId;
use crate::error::{Error, Result};
use crate::status::StatusAggregator;

/// Bounded queue split into one serial partition per worker.
///
/// A file always hashes to the same partition, so no two workers ever
/// process the same photo at once. Pushing into a full partition blocks the
/// producer; nothing is dropped.
#[derive(Clone)]
pub struct IngestQueue {
    partitions: Vec<mpsc::Sender<IngestTask>>,
    aggregator: Arc<StatusAggregator>,
}

impl IngestQueue {
    /// Returns the queue and one receiver per partition.
    pub fn new(
        workers: usize,
        capacity: usize,
        aggregator: Arc<StatusAggregator>,
    ) -> (Self, Vec<mpsc::Receiver<IngestTask>>) {
        let workers = workers.max(1);
        let per_partition = (capacity / workers).max(1);

        let (partitions, receivers) = (0..workers)
            .map(|_| mpsc::channel(per_partition))
            .unzip();

        (
            Self {
                partitions,
                aggregator,
            },
            receivers,
        )
    }

    pub fn partition_for(&self, root_id: RootId, rel_path: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        root_id.hash(&mut hasher);
        rel_path.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Blocking push, for the scanner running on the blocking pool.
    pub fn push_blocking(&self, task: IngestTask) -> Result<()> {
        let partition = self.partition_for(task.root_id, &task.rel_path);
        // Count before sending so the task is never invisible to status
        self.aggregator.ingest_queued();
        if self.partitions[partition].blocking_send(task).is_err() {
            self.aggregator.ingest_discarded();
            return Err(Error::Stopped);
        }
        Ok(())
    }

    pub async fn push(&self, task: IngestTask) -> Result<()> {
        let partition = self.partition_for(task.root_id, &task.rel_path);
        self.aggregator.ingest_queued();
        if self.partitions[partition].send(task).await.is_err() {
            self.aggregator.ingest_discarded();
            return Err(Error::Stopped);
        }
        Ok(())
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }
}
