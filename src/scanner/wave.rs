use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::{Catalog, RootId};
use crate::error::Result;

/// Live counters for one wave, shared between the scanner, the ingest
/// workers and the status aggregator.
#[derive(Debug, Default)]
pub struct WaveProgress {
    found: AtomicU64,
    enqueued: AtomicU64,
    processed: AtomicU64,
    enumerated: AtomicBool,
    had_errors: AtomicBool,
    finished: AtomicBool,
}

impl WaveProgress {
    pub fn add_found(&self) {
        self.found.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_errors(&self) {
        self.had_errors.store(true, Ordering::SeqCst);
    }

    pub fn mark_enumerated(&self) {
        self.enumerated.store(true, Ordering::SeqCst);
    }

    pub fn found(&self) -> u64 {
        self.found.load(Ordering::SeqCst)
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn had_errors(&self) -> bool {
        self.had_errors.load(Ordering::SeqCst)
    }

    pub fn is_enumerated(&self) -> bool {
        self.enumerated.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// `(found, enqueued, processed)`
    pub fn counts(&self) -> (u64, u64, u64) {
        (self.found(), self.enqueued(), self.processed())
    }
}

/// One enumeration pass over a root.
#[derive(Debug, Clone)]
pub struct ScanWave {
    pub id: i64,
    pub root_id: RootId,
    pub started_at: DateTime<Utc>,
    pub progress: Arc<WaveProgress>,
}

impl ScanWave {
    pub fn begin(catalog: &Catalog, root_id: RootId) -> Result<Self> {
        let started_at = Utc::now();
        let id = catalog.start_wave(root_id, started_at)?;
        catalog.mark_scan_started(root_id, started_at)?;
        Ok(Self {
            id,
            root_id,
            started_at,
            progress: Arc::new(WaveProgress::default()),
        })
    }

    pub fn found(&self) -> u64 {
        self.progress.found()
    }

    pub fn enqueued(&self) -> u64 {
        self.progress.enqueued()
    }

    pub fn processed(&self) -> u64 {
        self.progress.processed()
    }

    pub fn had_errors(&self) -> bool {
        self.progress.had_errors()
    }

    /// Close the wave once enumeration is done and every enqueued task is
    /// processed. Safe to call from any number of places; only the first
    /// caller that sees the wave complete writes it. Returns whether this
    /// call closed it.
    ///
    /// `last_scan_finished_at` is only stamped for clean waves, so an
    /// interrupted root keeps reporting its last good scan.
    pub fn maybe_finish(&self, catalog: &Catalog) -> Result<bool> {
        let p = &self.progress;
        if !p.is_enumerated() || p.processed() < p.enqueued() {
            return Ok(false);
        }
        if p.finished.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let now = Utc::now();
        catalog.finish_wave(self.id, p.counts(), p.had_errors(), now)?;
        if !p.had_errors() {
            catalog.mark_scan_finished(self.root_id, now)?;
        }
        Ok(true)
    }

    /// Flush the counters to the catalog without closing the wave.
    pub fn checkpoint(&self, catalog: &Catalog) -> Result<()> {
        let (found, enqueued, processed) = self.progress.counts();
        catalog.update_wave(self.id, found, enqueued, processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_finishes_once_after_enumeration_and_drain() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();
        let wave = ScanWave::begin(&catalog, root.id).unwrap();

        wave.progress.add_found();
        wave.progress.add_found();
        wave.progress.add_enqueued();
        assert!(!wave.maybe_finish(&catalog).unwrap());

        wave.progress.mark_enumerated();
        assert!(!wave.maybe_finish(&catalog).unwrap());

        wave.progress.add_processed();
        assert!(wave.maybe_finish(&catalog).unwrap());
        assert!(!wave.maybe_finish(&catalog).unwrap());

        let record = catalog.last_wave(root.id).unwrap().unwrap();
        assert_eq!((record.found, record.enqueued, record.processed), (2, 1, 1));
        assert!(catalog.get_root(root.id).unwrap().unwrap().last_scan_finished_at.is_some());
    }

    #[test]
    fn test_errored_wave_leaves_last_finished_untouched() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();
        let wave = ScanWave::begin(&catalog, root.id).unwrap();

        wave.progress.mark_errors();
        wave.progress.mark_enumerated();
        assert!(wave.maybe_finish(&catalog).unwrap());

        assert!(catalog.last_wave(root.id).unwrap().unwrap().had_errors);
        assert!(catalog.get_root(root.id).unwrap().unwrap().last_scan_finished_at.is_none());
    }
}
