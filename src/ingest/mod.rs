//! Bounded ingest queue and the worker pool that drains it.

pub mod queue;
pub mod retry;
pub mod worker;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::db::{PhotoId, RootId};
use crate::scanner::{ChangeKind, Fingerprint, ScanWave};

pub use queue::IngestQueue;
pub use retry::RetryPolicy;
pub use worker::{spawn_workers, IngestContext};

/// One New/Changed/Retry file headed for the workers.
#[derive(Debug, Clone)]
pub struct IngestTask {
    pub root_id: RootId,
    pub root_path: Arc<PathBuf>,
    pub rel_path: String,
    pub kind: ChangeKind,
    pub photo_id: Option<PhotoId>,
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
    pub mtime_ns: i64,
    pub wave: ScanWave,
    /// The root's online flag at enqueue time. Once false, the task is stale.
    pub online: Arc<AtomicBool>,
}

impl IngestTask {
    pub fn abs_path(&self) -> PathBuf {
        self.root_path.join(&self.rel_path)
    }
}
