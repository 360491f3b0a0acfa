//! The running indexer: wires the catalog, roots, scanner, ingest pool,
//! vector index and status aggregator together and owns their tasks.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, IndexConfig};
use crate::db::{Catalog, PhotoRecord, RootId};
use crate::error::{Error, Result};
use crate::index::{reconcile, VectorIndex};
use crate::ingest::{spawn_workers, IngestContext, IngestQueue, RetryPolicy};
use crate::media::{DateExtractor, Embedder, ExifDateExtractor, ImageThumbnailer, Thumbnailer};
use crate::roots::{Root, RootManager, Transition};
use crate::scanner::{ChangeDetector, Scanner};
use crate::scheduler::{spawn_coordinator, spawn_scan_loop, Coordinator, ScanScheduler};
use crate::shutdown::Shutdown;
use crate::status::{spawn_broadcaster, RecentIngest, StatusAggregator, StatusSnapshot, StatusStream};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_POLL: Duration = Duration::from_millis(25);
/// Consecutive idle polls before `wait_idle` believes it.
const IDLE_STREAK: u32 = 3;
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// External collaborators the ingest workers call.
pub struct Collaborators {
    pub dates: Arc<dyn DateExtractor>,
    pub thumbnailer: Arc<dyn Thumbnailer>,
    /// Without an embedder the index is never opened and search returns nothing.
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl Collaborators {
    /// EXIF dates and on-disk JPEG thumbnails, no embedding model.
    pub fn standard(config: &Config) -> Self {
        Self {
            dates: Arc::new(ExifDateExtractor),
            thumbnailer: Arc::new(ImageThumbnailer::new(&config.thumbnails)),
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }
}

/// One semantic search result, joined with its catalog row.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub photo: PhotoRecord,
    pub path: PathBuf,
    pub score: f32,
}

pub struct Indexer {
    catalog: Arc<Catalog>,
    roots: Arc<RootManager>,
    index: Option<Arc<VectorIndex>>,
    aggregator: Arc<StatusAggregator>,
    coordinator: Arc<Coordinator>,
    shutdown: Arc<Shutdown>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Indexer {
    /// Open the catalog and index, reconcile them, check every known root
    /// and start the background tasks.
    pub async fn start(config: Config, collaborators: Collaborators) -> Result<Self> {
        let config = config.validate();
        let catalog = Arc::new(Catalog::open(&config.db_path)?);
        let abandoned = catalog.abandon_open_waves(Utc::now())?;
        if abandoned > 0 {
            info!(abandoned, "Closed scan waves left open by a previous run");
        }

        let index = match &collaborators.embedder {
            Some(embedder) => Some(Arc::new(
                open_index(embedder.as_ref(), &config.index, catalog.clone()).await?,
            )),
            None => {
                info!("No embedding model configured, content search disabled");
                None
            }
        };
        let embeddings_enabled = Arc::new(AtomicBool::new(collaborators.embedder.is_some()));

        let shutdown = Arc::new(Shutdown::new());
        let aggregator = Arc::new(StatusAggregator::new(catalog.clone()));
        let roots = Arc::new(RootManager::new(catalog.clone(), config.roots.clone()));
        let (scheduler, coordinator_rx) = ScanScheduler::new(roots.clone(), aggregator.clone());
        let scheduler = Arc::new(scheduler);
        let mut tasks = Vec::new();

        let detector = if config.watcher.enabled {
            let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
            match ChangeDetector::new(Duration::from_millis(config.watcher.debounce_ms), tx) {
                Ok(detector) => {
                    tasks.push(spawn_watch_forwarder(rx, scheduler.clone(), shutdown.clone()));
                    Some(Arc::new(detector))
                }
                Err(e) => {
                    warn!(error = %e, "File watcher unavailable, relying on periodic rescans");
                    None
                }
            }
        } else {
            None
        };

        let coordinator = Arc::new(Coordinator::new(
            roots.clone(),
            scheduler.clone(),
            aggregator.clone(),
            detector,
        ));

        let (queue, receivers) = IngestQueue::new(
            config.ingest.workers,
            config.ingest.queue_capacity,
            aggregator.clone(),
        );
        let scanner = Arc::new(Scanner::new(
            catalog.clone(),
            index.clone(),
            collaborators.thumbnailer.clone(),
            queue,
            aggregator.clone(),
            roots.clone(),
            config.scanner.clone(),
            embeddings_enabled.clone(),
        ));
        let ingest = Arc::new(IngestContext {
            catalog: catalog.clone(),
            index: index.clone(),
            roots: roots.clone(),
            aggregator: aggregator.clone(),
            scheduler: scheduler.clone(),
            dates: collaborators.dates,
            thumbnailer: collaborators.thumbnailer,
            embedder: collaborators.embedder,
            embeddings_enabled,
            policy: RetryPolicy::from_config(&config.ingest.retry),
            config: config.ingest.clone(),
            shutdown: shutdown.clone(),
        });

        tasks.extend(spawn_workers(ingest, receivers));
        tasks.push(spawn_scan_loop(scanner, coordinator.clone(), shutdown.clone()));

        // Startup check of every root; roots already online are rescanned once
        if let Err(e) = coordinator.check_all(0).await {
            shutdown.signal();
            return Err(e);
        }

        tasks.push(spawn_coordinator(
            coordinator.clone(),
            coordinator_rx,
            shutdown.clone(),
        ));
        tasks.push(spawn_broadcaster(
            aggregator.clone(),
            &config.status,
            shutdown.subscribe(),
        ));
        if let Some(index) = &index {
            tasks.push(spawn_maintenance(
                index.clone(),
                catalog.clone(),
                &config.index,
                shutdown.clone(),
            ));
        }

        info!(
            workers = config.ingest.workers,
            db = %config.db_path.display(),
            "Indexer started"
        );

        Ok(Self {
            catalog,
            roots,
            index,
            aggregator,
            coordinator,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if let Some(message) = self.shutdown.fatal_error() {
            return Err(Error::Fatal(message));
        }
        if self.shutdown.is_signalled() {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    /// Register a root and run its first health check, which queues the
    /// initial scan when the path is reachable.
    pub async fn add_root(&self, path: &Path) -> Result<Root> {
        self.ensure_running()?;
        let roots = self.roots.clone();
        let path = path.to_path_buf();
        let root = tokio::task::spawn_blocking(move || roots.add_root(&path))
            .await
            .map_err(|e| Error::Fatal(format!("Root registration panicked: {}", e)))??;

        self.aggregator.roots_changed();
        self.coordinator.check_root(root.id).await?;
        self.roots.get_root(root.id)
    }

    pub fn list_roots(&self) -> Result<Vec<Root>> {
        self.roots.list_roots()
    }

    /// Read access to the catalog for listings and inspection.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub async fn check_health(&self, root_id: RootId) -> Result<Option<Transition>> {
        self.ensure_running()?;
        self.coordinator.check_root(root_id).await
    }

    /// Idempotent "maybe scan this root". False when the root is not online
    /// or the scan queue is full.
    pub fn request_scan(&self, root_id: RootId) -> bool {
        self.ensure_running().is_ok() && self.coordinator.scheduler().request_scan(root_id)
    }

    /// A snapshot computed right now.
    pub fn status(&self) -> StatusSnapshot {
        self.aggregator.snapshot()
    }

    pub fn subscribe(&self) -> StatusStream {
        self.aggregator.subscribe()
    }

    pub fn recent_activity(&self, limit: usize) -> Vec<RecentIngest> {
        self.aggregator.recent_activity(limit)
    }

    /// Top-`k` photos closest to `vector`. Empty without an embedder.
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let index = match &self.index {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };

        let roots: std::collections::HashMap<RootId, PathBuf> = self
            .roots
            .list_roots()?
            .into_iter()
            .map(|r| (r.id, r.path))
            .collect();

        let mut hits = Vec::new();
        for neighbor in index.query(vector, k)? {
            // A photo deleted after the query ran is simply left out
            let photo = match self.catalog.get_photo(neighbor.photo_id)? {
                Some(photo) => photo,
                None => continue,
            };
            let path = roots
                .get(&photo.root_id)
                .map(|root| root.join(&photo.rel_path))
                .unwrap_or_else(|| PathBuf::from(&photo.rel_path));
            hits.push(SearchHit {
                photo,
                path,
                score: neighbor.score,
            });
        }
        Ok(hits)
    }

    /// Nothing queued or running in any stage of the pipeline.
    pub fn is_idle(&self) -> bool {
        self.aggregator.is_idle() && self.coordinator.scheduler().is_idle()
    }

    /// Wait until the pipeline drains. False on timeout or shutdown.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut streak = 0;
        loop {
            if self.shutdown.is_signalled() {
                return false;
            }
            if self.is_idle() {
                streak += 1;
                if streak >= IDLE_STREAK {
                    return true;
                }
            } else {
                streak = 0;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(IDLE_POLL).await;
        }
    }

    /// The first fatal error, if the pipeline halted on one.
    pub fn fatal_error(&self) -> Option<String> {
        self.shutdown.fatal_error()
    }

    /// Stop every task, persist the index and publish a final snapshot.
    /// Returns the fatal error that halted the pipeline, if any.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.signal();

        let handles = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            if timeout(JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Background task did not stop in time, aborting it");
                handle.abort();
            }
        }

        if let Some(index) = self.index.clone() {
            match tokio::task::spawn_blocking(move || index.persist()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to persist vector index"),
                Err(e) => error!(error = %e, "Index persist panicked"),
            }
        }

        self.aggregator.publish();
        info!("Indexer stopped");

        match self.shutdown.fatal_error() {
            Some(message) => Err(Error::Fatal(message)),
            None => Ok(()),
        }
    }
}

async fn open_index(
    embedder: &dyn Embedder,
    config: &IndexConfig,
    catalog: Arc<Catalog>,
) -> Result<VectorIndex> {
    let dimensions = embedder.dimensions();
    let model_id = embedder.model_id().to_string();
    let config = config.clone();

    tokio::task::spawn_blocking(move || -> Result<VectorIndex> {
        let index = VectorIndex::open(dimensions, &model_id, &config)?;
        reconcile(&catalog, &index)?;
        Ok(index)
    })
    .await
    .map_err(|e| Error::Fatal(format!("Index load panicked: {}", e)))?
}

/// Forward watcher activity to the coordinator.
fn spawn_watch_forwarder(
    mut rx: mpsc::Receiver<RootId>,
    scheduler: Arc<ScanScheduler>,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                root_id = rx.recv() => match root_id {
                    Some(root_id) => scheduler.report_activity(root_id),
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
        debug!("Watch forwarder stopped");
    })
}

/// Periodic index persist, compacting first when tombstones pile up.
fn spawn_maintenance(
    index: Arc<VectorIndex>,
    catalog: Arc<Catalog>,
    config: &IndexConfig,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    let every = Duration::from_secs(config.persist_interval_secs.max(1));
    let ratio = config.compaction_tombstone_ratio;
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            let index = index.clone();
            let catalog = catalog.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<()> {
                if index.needs_compaction(ratio) {
                    let reclaimed = index.compact(&catalog)?;
                    info!(reclaimed, "Compacted vector index");
                }
                index.persist()?;
                Ok(())
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_fatal() => {
                    shutdown.fatal(format!("Index maintenance failed: {}", e));
                    break;
                }
                Ok(Err(e)) => warn!(error = %e, "Index maintenance failed"),
                Err(e) => error!(error = %e, "Index maintenance panicked"),
            }
        }
        debug!("Index maintenance stopped");
    })
}
