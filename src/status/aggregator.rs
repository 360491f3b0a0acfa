use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::warn;

use super::{RecentIngest, StatusSnapshot, StatusStream};
use crate::db::{Catalog, RootId};
use crate::scanner::WaveProgress;

const RECENT_CAPACITY: usize = 50;

struct OpenWave {
    wave_id: i64,
    path: String,
    progress: Arc<WaveProgress>,
}

struct ActiveIngest {
    worker: usize,
    root_id: RootId,
    root_path: String,
    path: String,
    seq: u64,
}

/// Scans between the first start and the moment the scan queue drains.
#[derive(Default)]
struct WaveAggregate {
    roots: HashSet<RootId>,
    found: u64,
    had_errors: bool,
}

struct LastWave {
    ended_at: DateTime<Utc>,
    found: u64,
    roots: u64,
    had_errors: bool,
}

#[derive(Default)]
struct AggregatorState {
    scan_queue_size: usize,
    ingest_queued: usize,
    active_scan: Option<RootId>,
    open_waves: HashMap<RootId, OpenWave>,
    active_ingests: Vec<ActiveIngest>,
    ingest_seq: u64,
    failed_total: u64,
    last_failed: Option<(String, String)>,
    wave: Option<WaveAggregate>,
    last_wave: Option<LastWave>,
    recent: VecDeque<RecentIngest>,
    root_counts: (u64, u64),
    photo_counts: (u64, u64),
}

impl AggregatorState {
    /// The root status reporting centres on: the scanning root, else the
    /// root of the most recently started ingest.
    fn focus_root(&self) -> Option<RootId> {
        self.active_scan.or_else(|| {
            self.active_ingests
                .iter()
                .max_by_key(|a| a.seq)
                .map(|a| a.root_id)
        })
    }
}

/// Owns every piece of status state. All mutation goes through the event
/// methods below; each one wakes the broadcaster, which coalesces.
pub struct StatusAggregator {
    catalog: Arc<Catalog>,
    state: Mutex<AggregatorState>,
    changed: Notify,
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusAggregator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::empty());
        let aggregator = Self {
            catalog,
            state: Mutex::new(AggregatorState::default()),
            changed: Notify::new(),
            tx,
        };
        aggregator.publish();
        aggregator
    }

    fn touch(&self) {
        self.changed.notify_one();
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// A new wave for the root replaces any older one still draining.
    pub fn scan_started(
        &self,
        root_id: RootId,
        wave_id: i64,
        root_path: &str,
        progress: Arc<WaveProgress>,
    ) {
        {
            let mut state = self.state.lock();
            state.active_scan = Some(root_id);
            state.open_waves.insert(
                root_id,
                OpenWave {
                    wave_id,
                    path: root_path.to_string(),
                    progress,
                },
            );
            state
                .wave
                .get_or_insert_with(WaveAggregate::default)
                .roots
                .insert(root_id);
        }
        self.touch();
    }

    /// Counters live in the shared `WaveProgress`; this only marks a change.
    pub fn scan_progress(&self) {
        self.touch();
    }

    /// Enumeration for `root_id` is over. Closes the wave aggregate when no
    /// more scans are queued.
    pub fn scan_finished(
        &self,
        root_id: RootId,
        found: u64,
        had_errors: bool,
        remaining_scan_queue: usize,
    ) {
        {
            let mut state = self.state.lock();
            if state.active_scan == Some(root_id) {
                state.active_scan = None;
            }

            let wave = state.wave.get_or_insert_with(WaveAggregate::default);
            wave.roots.insert(root_id);
            wave.found += found;
            wave.had_errors |= had_errors;

            if remaining_scan_queue == 0 {
                if let Some(wave) = state.wave.take() {
                    state.last_wave = Some(LastWave {
                        ended_at: Utc::now(),
                        found: wave.found,
                        roots: wave.roots.len() as u64,
                        had_errors: wave.had_errors,
                    });
                }
            }
        }
        self.touch();
    }

    /// Every ingest task of this wave has been processed. A newer wave for
    /// the same root stays open.
    pub fn wave_closed(&self, root_id: RootId, wave_id: i64) {
        {
            let mut state = self.state.lock();
            if state.open_waves.get(&root_id).map(|w| w.wave_id) == Some(wave_id) {
                state.open_waves.remove(&root_id);
            }
        }
        self.touch();
    }

    pub fn ingest_queued(&self) {
        self.state.lock().ingest_queued += 1;
        self.touch();
    }

    /// A counted task never reached a worker.
    pub fn ingest_discarded(&self) {
        {
            let mut state = self.state.lock();
            state.ingest_queued = state.ingest_queued.saturating_sub(1);
        }
        self.touch();
    }

    pub fn begin_ingest(&self, worker: usize, root_id: RootId, root_path: &str, path: &str) {
        {
            let mut state = self.state.lock();
            state.ingest_queued = state.ingest_queued.saturating_sub(1);
            state.ingest_seq += 1;
            let seq = state.ingest_seq;
            state.active_ingests.retain(|a| a.worker != worker);
            state.active_ingests.push(ActiveIngest {
                worker,
                root_id,
                root_path: root_path.to_string(),
                path: path.to_string(),
                seq,
            });
        }
        self.touch();
    }

    pub fn end_ingest(&self, worker: usize, recent: Option<RecentIngest>) {
        {
            let mut state = self.state.lock();
            state.active_ingests.retain(|a| a.worker != worker);
            if let Some(entry) = recent {
                if state.recent.len() == RECENT_CAPACITY {
                    state.recent.pop_front();
                }
                state.recent.push_back(entry);
            }
        }
        self.touch();
    }

    pub fn record_failure(&self, path: &str, error: &str) {
        {
            let mut state = self.state.lock();
            state.failed_total += 1;
            state.last_failed = Some((path.to_string(), error.to_string()));
        }
        self.touch();
    }

    pub fn set_scan_queue_size(&self, size: usize) {
        {
            let mut state = self.state.lock();
            if state.scan_queue_size == size {
                return;
            }
            state.scan_queue_size = size;
        }
        self.touch();
    }

    /// Root counts changed (root added, status transition).
    pub fn roots_changed(&self) {
        self.touch();
    }

    /// Nothing queued or running anywhere in the pipeline.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.scan_queue_size == 0
            && state.active_scan.is_none()
            && state.ingest_queued == 0
            && state.active_ingests.is_empty()
    }

    pub fn failed_total(&self) -> u64 {
        self.state.lock().failed_total
    }

    /// Most recent first.
    pub fn recent_activity(&self, limit: usize) -> Vec<RecentIngest> {
        self.state
            .lock()
            .recent
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Compute a consistent snapshot right now.
    pub fn snapshot(&self) -> StatusSnapshot {
        // Catalog first, so the state lock is never held across a store call
        let root_counts = self.catalog.count_roots();
        let photo_counts = self.catalog.count_photos();

        let mut state = self.state.lock();
        match root_counts {
            Ok(c) => state.root_counts = c,
            Err(e) => warn!(error = %e, "Failed to count roots for status"),
        }
        match photo_counts {
            Ok(c) => state.photo_counts = c,
            Err(e) => warn!(error = %e, "Failed to count photos for status"),
        }

        let latest_ingest = state.active_ingests.iter().max_by_key(|a| a.seq);
        let focus = state.focus_root();
        let focus_wave = focus.and_then(|id| state.open_waves.get(&id));
        let focus_path = focus_wave.map(|w| w.path.clone()).or_else(|| {
            latest_ingest
                .filter(|a| Some(a.root_id) == focus)
                .map(|a| a.root_path.clone())
        });
        let active_ingest_path = latest_ingest.map(|a| a.path.clone());

        StatusSnapshot {
            roots_total: state.root_counts.0,
            roots_online: state.root_counts.1,
            photos_total: state.photo_counts.0,
            photos_indexed: state.photo_counts.1,
            scan_queue_size: state.scan_queue_size,
            ingest_queue_size: state.ingest_queued,
            active_scan_root_id: focus,
            active_scan_root_path: focus_path,
            active_scan_enqueued: focus_wave.map(|w| w.progress.enqueued()),
            active_scan_processed: focus_wave.map(|w| w.progress.processed()),
            active_scan_found: focus_wave.map(|w| w.progress.found()),
            active_ingest_path,
            failed_total: state.failed_total,
            last_failed_path: state.last_failed.as_ref().map(|(p, _)| p.clone()),
            last_failed_error: state.last_failed.as_ref().map(|(_, e)| e.clone()),
            last_scan_wave_ended_at: state.last_wave.as_ref().map(|w| w.ended_at),
            last_scan_wave_found: state.last_wave.as_ref().map(|w| w.found),
            last_scan_wave_roots: state.last_wave.as_ref().map(|w| w.roots),
            last_scan_wave_had_errors: state.last_wave.as_ref().map(|w| w.had_errors),
            now: Utc::now(),
        }
    }

    /// Replace the published value. Never blocks on subscribers.
    pub fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }

    pub fn subscribe(&self) -> StatusStream {
        StatusStream::new(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn aggregator() -> (Arc<Catalog>, StatusAggregator) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let aggregator = StatusAggregator::new(catalog.clone());
        (catalog, aggregator)
    }

    #[test]
    fn test_focus_follows_scan_then_ingest() {
        let (catalog, agg) = aggregator();
        let a = catalog.insert_root(Path::new("/a")).unwrap();
        let progress = Arc::new(WaveProgress::default());
        progress.add_found();
        progress.add_enqueued();

        agg.scan_started(a.id, 1, "/a", progress.clone());
        agg.ingest_queued();
        let snap = agg.snapshot();
        assert_eq!(snap.active_scan_root_id, Some(a.id));
        assert_eq!(snap.active_scan_root_path.as_deref(), Some("/a"));
        assert_eq!(snap.active_scan_found, Some(1));
        assert_eq!(snap.ingest_queue_size, 1);

        agg.scan_finished(a.id, 1, false, 0);
        agg.begin_ingest(0, a.id, "/a", "/a/x.jpg");
        let snap = agg.snapshot();
        assert_eq!(snap.active_scan_root_id, Some(a.id));
        assert_eq!(snap.active_ingest_path.as_deref(), Some("/a/x.jpg"));
        assert_eq!(snap.ingest_queue_size, 0);
        assert_eq!(snap.last_scan_wave_roots, Some(1));
        assert!(!agg.is_idle());

        progress.add_processed();
        agg.wave_closed(a.id, 1);
        agg.end_ingest(0, None);
        let snap = agg.snapshot();
        assert_eq!(snap.active_scan_root_id, None);
        assert_eq!(snap.active_scan_found, None);
        assert!(agg.is_idle());
    }

    #[test]
    fn test_wave_aggregate_spans_queued_scans() {
        let (_catalog, agg) = aggregator();
        agg.scan_started(1, 1, "/a", Arc::new(WaveProgress::default()));
        agg.scan_finished(1, 10, false, 1);
        assert!(agg.snapshot().last_scan_wave_ended_at.is_none());

        agg.scan_started(2, 2, "/b", Arc::new(WaveProgress::default()));
        agg.scan_finished(2, 5, true, 0);

        let snap = agg.snapshot();
        assert!(snap.last_scan_wave_ended_at.is_some());
        assert_eq!(snap.last_scan_wave_found, Some(15));
        assert_eq!(snap.last_scan_wave_roots, Some(2));
        assert_eq!(snap.last_scan_wave_had_errors, Some(true));
    }

    #[test]
    fn test_failures_and_recent_ring() {
        let (_catalog, agg) = aggregator();
        agg.record_failure("/a/bad.jpg", "decode error");
        agg.record_failure("/a/worse.jpg", "timeout");

        let snap = agg.snapshot();
        assert_eq!(snap.failed_total, 2);
        assert_eq!(snap.last_failed_path.as_deref(), Some("/a/worse.jpg"));
        assert_eq!(snap.last_failed_error.as_deref(), Some("timeout"));

        for i in 0..60 {
            agg.begin_ingest(0, 1, "/a", "/a/x.jpg");
            agg.end_ingest(
                0,
                Some(RecentIngest {
                    photo_id: Some(i),
                    root_id: 1,
                    path: format!("/a/{}.jpg", i),
                    finished_at: Utc::now(),
                    ok: true,
                }),
            );
        }
        let recent = agg.recent_activity(100);
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent[0].photo_id, Some(59));
    }

    #[test]
    fn test_old_wave_draining_does_not_hide_new_scan() {
        let (_catalog, agg) = aggregator();
        agg.scan_started(1, 10, "/a", Arc::new(WaveProgress::default()));
        agg.scan_finished(1, 2, false, 0);

        let next = Arc::new(WaveProgress::default());
        for _ in 0..3 {
            next.add_found();
        }
        agg.scan_started(1, 11, "/a", next);

        // Last task of the earlier wave finishes mid-scan
        agg.wave_closed(1, 10);
        let snap = agg.snapshot();
        assert_eq!(snap.active_scan_root_id, Some(1));
        assert_eq!(snap.active_scan_found, Some(3));
        assert_eq!(snap.active_scan_root_path.as_deref(), Some("/a"));

        agg.wave_closed(1, 11);
        agg.scan_finished(1, 3, false, 0);
        assert_eq!(agg.snapshot().active_scan_found, None);
    }
}
