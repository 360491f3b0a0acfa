//! Root enumeration and change detection.
//!
//! A scan walks one root, classifies every tracked file against the catalog
//! and turns New/Changed/Retry files into ingest tasks. Rows whose files were
//! not seen are deleted immediately, together with their index entries.

pub mod change_detection;
pub mod discovery;
pub mod fingerprint;
pub mod watcher;
pub mod wave;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::db::{Catalog, PhotoRecord, Root};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::ingest::{IngestQueue, IngestTask};
use crate::media::Thumbnailer;
use crate::roots::RootManager;
use crate::status::StatusAggregator;

pub use change_detection::{classify, ChangeKind};
pub use fingerprint::Fingerprint;
pub use watcher::ChangeDetector;
pub use wave::{ScanWave, WaveProgress};

/// Flush wave counters to the catalog every this many candidates.
const CHECKPOINT_EVERY: u64 = 200;

/// The root being scanned and its cancellation flag for this online period.
#[derive(Debug, Clone)]
pub struct RootScanContext {
    pub root: Root,
    pub online: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub wave: ScanWave,
    pub deleted: u64,
    /// The root went offline mid-walk.
    pub cancelled: bool,
    /// The walk failed because the root path itself is gone.
    pub root_unavailable: bool,
}

pub struct Scanner {
    catalog: Arc<Catalog>,
    index: Option<Arc<VectorIndex>>,
    thumbnailer: Arc<dyn Thumbnailer>,
    queue: IngestQueue,
    aggregator: Arc<StatusAggregator>,
    roots: Arc<RootManager>,
    config: ScannerConfig,
    embeddings_enabled: Arc<AtomicBool>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        index: Option<Arc<VectorIndex>>,
        thumbnailer: Arc<dyn Thumbnailer>,
        queue: IngestQueue,
        aggregator: Arc<StatusAggregator>,
        roots: Arc<RootManager>,
        config: ScannerConfig,
        embeddings_enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            catalog,
            index,
            thumbnailer,
            queue,
            aggregator,
            roots,
            config,
            embeddings_enabled,
        }
    }

    /// Enumerate one root and enqueue everything that needs ingesting.
    ///
    /// Blocking: walks the filesystem and blocks on a full ingest queue. Only
    /// catalog failures are returned as errors; everything else ends up in
    /// the report and the wave's `had_errors`.
    pub fn scan(&self, ctx: &RootScanContext) -> Result<ScanReport> {
        let root = &ctx.root;
        let wave = ScanWave::begin(&self.catalog, root.id)?;
        self.aggregator.scan_started(
            root.id,
            wave.id,
            &root.path.display().to_string(),
            wave.progress.clone(),
        );
        info!(root_id = root.id, path = %root.path.display(), wave_id = wave.id, "Scan started");

        // Whatever is left in here after the walk was not seen on disk
        let mut unseen: HashMap<String, PhotoRecord> = self
            .catalog
            .photos_in_root(root.id)?
            .into_iter()
            .map(|p| (p.rel_path.clone(), p))
            .collect();

        let embeddings_enabled = self.embeddings_enabled.load(Ordering::SeqCst);
        let root_path = Arc::new(root.path.clone());
        let mut cancelled = false;
        let mut root_unavailable = false;
        let mut walk_errors = 0u64;

        for entry in discovery::walker(&root.path, self.config.skip_hidden) {
            if !ctx.online.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if !root.path.exists() {
                        root_unavailable = true;
                        break;
                    }
                    walk_errors += 1;
                    warn!(root_id = root.id, error = %e, "Error walking root");
                    continue;
                }
            };

            if !entry.file_type().is_file()
                || !discovery::has_tracked_extension(entry.path(), &self.config.image_extensions)
            {
                continue;
            }

            let rel_path = match discovery::relative_key(&root.path, entry.path()) {
                Some(key) => key,
                None => {
                    debug!(path = %entry.path().display(), "Skipping path that is not valid UTF-8");
                    continue;
                }
            };

            let previous = unseen.remove(&rel_path);
            wave.progress.add_found();

            let fingerprinted = entry.metadata().map_err(std::io::Error::from).and_then(|m| {
                fingerprint::compute(entry.path(), &m, self.config.fingerprint).map(|fp| (m, fp))
            });
            let (metadata, fp) = match fingerprinted {
                Ok(pair) => pair,
                Err(e) => {
                    walk_errors += 1;
                    warn!(path = %entry.path().display(), error = %e, "Cannot fingerprint file");
                    continue;
                }
            };

            let kind = classify(previous.as_ref(), &fp, embeddings_enabled);
            if kind.needs_ingest() {
                wave.progress.add_enqueued();
                let task = IngestTask {
                    root_id: root.id,
                    root_path: root_path.clone(),
                    rel_path,
                    kind,
                    photo_id: previous.as_ref().map(|p| p.id),
                    fingerprint: fp,
                    size_bytes: metadata.len(),
                    mtime_ns: fingerprint::mtime_ns(&metadata),
                    wave: wave.clone(),
                    online: ctx.online.clone(),
                };
                if self.queue.push_blocking(task).is_err() {
                    debug!(root_id = root.id, "Ingest queue closed, abandoning scan");
                    cancelled = true;
                    break;
                }
            }

            if wave.found() % CHECKPOINT_EVERY == 0 {
                wave.checkpoint(&self.catalog)?;
                self.aggregator.scan_progress();
            }
        }

        let complete = !cancelled && !root_unavailable;
        let mut deleted = 0;

        // A partial or failed walk proves nothing about missing files
        if complete && walk_errors == 0 && ctx.online.load(Ordering::SeqCst) {
            for photo in unseen.into_values() {
                if self.catalog.delete_photo(photo.id)? {
                    if let Some(index) = &self.index {
                        if let Err(e) = index.remove(photo.id) {
                            warn!(photo_id = photo.id, error = %e, "Failed to drop deleted photo from index");
                        }
                    }
                    self.thumbnailer.evict(photo.id);
                    debug!(root_id = root.id, path = %photo.rel_path, "Photo removed");
                    deleted += 1;
                }
            }
        }

        if !complete || walk_errors > 0 {
            wave.progress.mark_errors();
        }
        if walk_errors > 0 {
            self.roots.record_root_error(
                root.id,
                &format!("{} entries could not be read during scan", walk_errors),
            )?;
        }
        if complete {
            self.catalog.mark_scan_enumerated(root.id, Utc::now())?;
        }

        wave.progress.mark_enumerated();
        wave.checkpoint(&self.catalog)?;
        if wave.maybe_finish(&self.catalog)? {
            self.aggregator.wave_closed(root.id, wave.id);
        }

        info!(
            root_id = root.id,
            found = wave.found(),
            enqueued = wave.enqueued(),
            deleted,
            cancelled,
            root_unavailable,
            "Scan enumerated"
        );

        Ok(ScanReport {
            wave,
            deleted,
            cancelled,
            root_unavailable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{DateSource, PhotoUpsert, ThumbnailState};
    use crate::media::ImageThumbnailer;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<Catalog>,
        roots: Arc<RootManager>,
        scanner: Scanner,
        receivers: Vec<mpsc::Receiver<IngestTask>>,
        root: Root,
    }

    fn fixture(files: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let photos = dir.path().join("photos");
        fs::create_dir_all(&photos).unwrap();
        for name in files {
            let path = photos.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, name.as_bytes()).unwrap();
        }

        let config = Config::with_data_dir(dir.path());
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let roots = Arc::new(RootManager::new(catalog.clone(), config.roots.clone()));
        let root = roots.add_root(&photos).unwrap();
        roots.check_health(root.id).unwrap();
        let root = roots.get_root(root.id).unwrap();

        let aggregator = Arc::new(StatusAggregator::new(catalog.clone()));
        let (queue, receivers) = IngestQueue::new(1, 100, aggregator.clone());
        let scanner = Scanner::new(
            catalog.clone(),
            None,
            Arc::new(ImageThumbnailer::new(&config.thumbnails)),
            queue,
            aggregator,
            roots.clone(),
            config.scanner.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        Fixture {
            _dir: dir,
            catalog,
            roots,
            scanner,
            receivers,
            root,
        }
    }

    fn scan(f: &Fixture) -> ScanReport {
        let ctx = RootScanContext {
            root: f.root.clone(),
            online: f.roots.online_flag(f.root.id),
        };
        f.scanner.scan(&ctx).unwrap()
    }

    /// Stand-in for the worker: catalog every queued task as fully ingested.
    fn drain(f: &mut Fixture) -> Vec<String> {
        let mut paths = Vec::new();
        while let Ok(task) = f.receivers[0].try_recv() {
            let outcome = f
                .catalog
                .upsert_photo(&PhotoUpsert {
                    root_id: task.root_id,
                    rel_path: &task.rel_path,
                    size_bytes: task.size_bytes as i64,
                    mtime_ns: task.mtime_ns,
                    fingerprint: task.fingerprint.as_str(),
                    date_taken: Utc::now(),
                    date_source: DateSource::Mtime,
                })
                .unwrap();
            f.catalog
                .set_thumbnail_state(outcome.id, ThumbnailState::Complete, Some((1, 1)))
                .unwrap();
            task.wave.progress.add_processed();
            task.wave.maybe_finish(&f.catalog).unwrap();
            paths.push(task.rel_path);
        }
        paths
    }

    #[test]
    fn test_first_scan_enqueues_every_file() {
        let mut f = fixture(&["a.jpg", "b.png", "nested/c.jpeg", "notes.txt"]);
        let report = scan(&f);

        assert_eq!(report.wave.found(), 3);
        assert_eq!(report.wave.enqueued(), 3);
        assert!(!report.cancelled);
        assert_eq!(drain(&mut f), vec!["a.jpg", "b.png", "nested/c.jpeg"]);

        let root = f.catalog.get_root(f.root.id).unwrap().unwrap();
        assert!(root.last_scan_enumerated_at.is_some());
        assert!(root.last_scan_finished_at.is_some());
    }

    #[test]
    fn test_rescan_without_changes_enqueues_nothing() {
        let mut f = fixture(&["a.jpg", "b.jpg"]);
        scan(&f);
        drain(&mut f);

        let report = scan(&f);
        assert_eq!(report.wave.found(), 2);
        assert_eq!(report.wave.enqueued(), 0);
        assert!(drain(&mut f).is_empty());

        // Nothing in flight, so the wave closes during the scan itself
        let wave = f.catalog.last_wave(f.root.id).unwrap().unwrap();
        assert!(wave.finished_at.is_some());
    }

    #[test]
    fn test_deleted_file_removes_row() {
        let mut f = fixture(&["a.jpg", "b.jpg"]);
        scan(&f);
        drain(&mut f);

        fs::remove_file(f.root.path.join("b.jpg")).unwrap();
        let report = scan(&f);

        assert_eq!(report.deleted, 1);
        assert!(f.catalog.photo_by_key(f.root.id, "b.jpg").unwrap().is_none());
        assert!(f.catalog.photo_by_key(f.root.id, "a.jpg").unwrap().is_some());
    }

    #[test]
    fn test_changed_file_is_reenqueued() {
        let mut f = fixture(&["a.jpg"]);
        scan(&f);
        drain(&mut f);

        fs::write(f.root.path.join("a.jpg"), b"different and longer content").unwrap();
        let report = scan(&f);
        assert_eq!(report.wave.enqueued(), 1);

        let task = f.receivers[0].try_recv().unwrap();
        assert_eq!(task.kind, ChangeKind::Changed);
        assert!(task.photo_id.is_some());
    }

    #[test]
    fn test_offline_root_cancels_without_deleting() {
        let mut f = fixture(&["a.jpg", "b.jpg"]);
        scan(&f);
        drain(&mut f);

        let online = f.roots.online_flag(f.root.id);
        online.store(false, Ordering::SeqCst);
        let report = scan(&f);

        assert!(report.cancelled);
        assert_eq!(report.deleted, 0);
        assert!(report.wave.had_errors());
        assert_eq!(f.catalog.photos_in_root(f.root.id).unwrap().len(), 2);
    }
}
