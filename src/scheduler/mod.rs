//! Scan dispatch: a de-duplicated queue of roots to scan, plus the
//! coordinator that drives health checks and periodic rescans into it.

pub mod coordinator;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::db::RootId;
use crate::roots::RootManager;
use crate::status::StatusAggregator;

pub use coordinator::{spawn_coordinator, spawn_scan_loop, Coordinator};

/// Capacity of the coordinator's on-demand message channel.
const MESSAGE_CAPACITY: usize = 256;

/// On-demand work for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorMsg {
    /// Probe one root now.
    Health(RootId),
    /// The watcher saw changes under a root: probe it, then scan it.
    Activity(RootId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Active,
    /// Active, and another scan was requested meanwhile.
    ActiveDirty,
}

#[derive(Default)]
struct SchedulerState {
    slots: HashMap<RootId, Slot>,
    queue: VecDeque<RootId>,
}

/// Per-root scan slots. A root is never queued twice and never scanned by
/// two tasks at once; a request that arrives mid-scan is remembered and
/// replayed when the scan ends. The queue therefore never holds more
/// entries than there are tracked roots.
pub struct ScanScheduler {
    state: Mutex<SchedulerState>,
    wakeup: Notify,
    tx: mpsc::Sender<CoordinatorMsg>,
    roots: Arc<RootManager>,
    aggregator: Arc<StatusAggregator>,
}

impl ScanScheduler {
    pub fn new(
        roots: Arc<RootManager>,
        aggregator: Arc<StatusAggregator>,
    ) -> (Self, mpsc::Receiver<CoordinatorMsg>) {
        let (tx, rx) = mpsc::channel(MESSAGE_CAPACITY);
        let scheduler = Self {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Notify::new(),
            tx,
            roots,
            aggregator,
        };
        (scheduler, rx)
    }

    /// Idempotent "maybe scan this root".
    ///
    /// Returns true when a scan for the root is now pending, either freshly
    /// queued or already queued/running. Offline roots are refused.
    pub fn request_scan(&self, root_id: RootId) -> bool {
        if !self.roots.is_online(root_id) {
            debug!(root_id, "Scan request for root that is not online");
            return false;
        }

        let (accepted, queue_len) = {
            let mut state = self.state.lock();
            let accepted = match state.slots.get(&root_id).copied() {
                Some(Slot::Queued) | Some(Slot::ActiveDirty) => true,
                Some(Slot::Active) => {
                    state.slots.insert(root_id, Slot::ActiveDirty);
                    true
                }
                None => {
                    state.queue.push_back(root_id);
                    state.slots.insert(root_id, Slot::Queued);
                    true
                }
            };
            (accepted, state.queue.len())
        };

        self.aggregator.set_scan_queue_size(queue_len);
        self.wakeup.notify_one();
        accepted
    }

    /// Wait for the next root to scan. The root counts as active from here
    /// until [`scan_done`](Self::scan_done).
    pub async fn next_scan(&self) -> RootId {
        loop {
            let popped = {
                let mut state = self.state.lock();
                let next = state.queue.pop_front();
                if let Some(root_id) = next {
                    state.slots.insert(root_id, Slot::Active);
                }
                next.map(|id| (id, state.queue.len()))
            };

            if let Some((root_id, queue_len)) = popped {
                self.aggregator.set_scan_queue_size(queue_len);
                return root_id;
            }
            self.wakeup.notified().await;
        }
    }

    /// Release the root's slot, re-queueing it if a scan was requested
    /// while it ran.
    pub fn scan_done(&self, root_id: RootId) {
        let rerun = self.state.lock().slots.remove(&root_id) == Some(Slot::ActiveDirty);
        if rerun {
            self.request_scan(root_id);
        }
    }

    pub fn request_health_check(&self, root_id: RootId) {
        if self.tx.try_send(CoordinatorMsg::Health(root_id)).is_err() {
            debug!(root_id, "Health check request dropped");
        }
    }

    pub fn report_activity(&self, root_id: RootId) {
        if self.tx.try_send(CoordinatorMsg::Activity(root_id)).is_err() {
            debug!(root_id, "Activity notification dropped");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_active(&self, root_id: RootId) -> bool {
        matches!(
            self.state.lock().slots.get(&root_id),
            Some(Slot::Active) | Some(Slot::ActiveDirty)
        )
    }

    /// No root queued or being scanned.
    pub fn is_idle(&self) -> bool {
        self.state.lock().slots.is_empty()
    }
}
