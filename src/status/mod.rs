//! Live pipeline status: one lock-guarded aggregator fed by explicit
//! start/end events, published as latest-value-wins snapshots.

pub mod aggregator;
pub mod broadcast;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::db::{PhotoId, RootId};

pub use aggregator::StatusAggregator;
pub use broadcast::spawn_broadcaster;

/// The status document. Field names are part of the external contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub roots_total: u64,
    pub roots_online: u64,
    pub photos_total: u64,
    pub photos_indexed: u64,
    pub scan_queue_size: usize,
    pub ingest_queue_size: usize,
    pub active_scan_root_id: Option<RootId>,
    pub active_scan_root_path: Option<String>,
    pub active_scan_enqueued: Option<u64>,
    pub active_scan_processed: Option<u64>,
    pub active_scan_found: Option<u64>,
    pub active_ingest_path: Option<String>,
    pub failed_total: u64,
    pub last_failed_path: Option<String>,
    pub last_failed_error: Option<String>,
    pub last_scan_wave_ended_at: Option<DateTime<Utc>>,
    pub last_scan_wave_found: Option<u64>,
    pub last_scan_wave_roots: Option<u64>,
    pub last_scan_wave_had_errors: Option<bool>,
    pub now: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self {
            roots_total: 0,
            roots_online: 0,
            photos_total: 0,
            photos_indexed: 0,
            scan_queue_size: 0,
            ingest_queue_size: 0,
            active_scan_root_id: None,
            active_scan_root_path: None,
            active_scan_enqueued: None,
            active_scan_processed: None,
            active_scan_found: None,
            active_ingest_path: None,
            failed_total: 0,
            last_failed_path: None,
            last_failed_error: None,
            last_scan_wave_ended_at: None,
            last_scan_wave_found: None,
            last_scan_wave_roots: None,
            last_scan_wave_had_errors: None,
            now: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One entry of the recent-activity ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentIngest {
    pub photo_id: Option<PhotoId>,
    pub root_id: RootId,
    pub path: String,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
}

/// A subscriber's view of the status stream.
///
/// Backed by a single-slot watch channel: a slow reader only ever sees the
/// newest snapshot and never holds up the publisher.
pub struct StatusStream {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusStream {
    pub(crate) fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    /// The most recently published snapshot, without waiting.
    pub fn latest(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. `None` once the indexer is gone.
    pub async fn next(&mut self) -> Option<StatusSnapshot> {
        self.rx.changed().await.ok()?;
        let snapshot = self.rx.borrow_and_update().clone();
        Some(snapshot)
    }

    pub async fn next_json(&mut self) -> Option<String> {
        let snapshot = self.next().await?;
        snapshot.to_json().ok()
    }
}
