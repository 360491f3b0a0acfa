use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{CoordinatorMsg, ScanScheduler};
use crate::db::{RootId, RootStatus};
use crate::error::{Error, Result};
use crate::roots::{RootManager, Transition};
use crate::scanner::{ChangeDetector, RootScanContext, Scanner};
use crate::shutdown::Shutdown;
use crate::status::StatusAggregator;

/// Serializes root health checks and turns their transitions into scans
/// and watch subscriptions.
pub struct Coordinator {
    roots: Arc<RootManager>,
    scheduler: Arc<ScanScheduler>,
    aggregator: Arc<StatusAggregator>,
    detector: Option<Arc<ChangeDetector>>,
}

impl Coordinator {
    pub fn new(
        roots: Arc<RootManager>,
        scheduler: Arc<ScanScheduler>,
        aggregator: Arc<StatusAggregator>,
        detector: Option<Arc<ChangeDetector>>,
    ) -> Self {
        Self {
            roots,
            scheduler,
            aggregator,
            detector,
        }
    }

    pub fn scheduler(&self) -> &Arc<ScanScheduler> {
        &self.scheduler
    }

    /// Probe a root on the blocking pool and apply whatever changed.
    pub async fn check_root(&self, root_id: RootId) -> Result<Option<Transition>> {
        let roots = self.roots.clone();
        let transition = tokio::task::spawn_blocking(move || roots.check_health(root_id))
            .await
            .map_err(|e| Error::Fatal(format!("Health check panicked: {}", e)))??;

        if let Some(t) = &transition {
            self.apply(t);
        }
        Ok(transition)
    }

    /// Side effects of a transition: scan on entering Online, watch while
    /// online, unwatch otherwise.
    pub fn apply(&self, t: &Transition) {
        if t.scan {
            self.scheduler.request_scan(t.root_id);
        }

        if let Some(detector) = &self.detector {
            match t.to {
                RootStatus::Online => match self.roots.get_root(t.root_id) {
                    Ok(root) => {
                        if let Err(e) = detector.watch(t.root_id, &root.path) {
                            warn!(root_id = t.root_id, error = %e, "Cannot watch root, relying on periodic rescans");
                        }
                    }
                    Err(e) => warn!(root_id = t.root_id, error = %e, "Cannot look up root to watch"),
                },
                RootStatus::Offline | RootStatus::Missing => detector.unwatch(t.root_id),
                RootStatus::Unknown => {}
            }
        }

        self.aggregator.roots_changed();
    }

    /// Probe every root. Missing roots only every `missing_every`th tick.
    pub(crate) async fn check_all(&self, tick: u64) -> Result<()> {
        let missing_every = u64::from(self.roots.config().missing_check_every.max(1));
        for root in self.roots.list_roots()? {
            if root.status == RootStatus::Missing && tick % missing_every != 0 {
                continue;
            }
            self.check_logged(root.id).await?;
        }
        Ok(())
    }

    /// Request scans for online roots whose last scan started too long ago.
    fn rescan_due(&self) -> Result<()> {
        let max_age = chrono::Duration::seconds(self.roots.config().rescan_interval_secs as i64);
        let now = Utc::now();
        for root in self.roots.list_roots()? {
            if root.status != RootStatus::Online {
                continue;
            }
            let due = root
                .last_scan_started_at
                .map(|at| now - at >= max_age)
                .unwrap_or(true);
            if due && self.scheduler.request_scan(root.id) {
                debug!(root_id = root.id, "Periodic rescan requested");
            }
        }
        Ok(())
    }

    /// Only store failures escape; anything else about one root is logged.
    async fn check_logged(&self, root_id: RootId) -> Result<()> {
        match self.check_root(root_id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(root_id, error = %e, "Health check skipped");
                Ok(())
            }
        }
    }

    async fn handle(&self, msg: CoordinatorMsg) -> Result<()> {
        match msg {
            CoordinatorMsg::Health(root_id) => self.check_logged(root_id).await,
            CoordinatorMsg::Activity(root_id) => {
                self.check_logged(root_id).await?;
                self.scheduler.request_scan(root_id);
                Ok(())
            }
        }
    }
}

/// Health ticker, rescan ticker and on-demand messages, all on one task so
/// root transitions never race. The startup check of every root is the
/// caller's job; the first tick here comes one interval later.
pub fn spawn_coordinator(
    coordinator: Arc<Coordinator>,
    mut rx: mpsc::Receiver<CoordinatorMsg>,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    let config = coordinator.roots.config().clone();
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        let health_every = Duration::from_secs(config.health_interval_secs.max(1));
        let mut health = interval_at(Instant::now() + health_every, health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let rescan_every = Duration::from_secs(config.rescan_interval_secs.clamp(1, 60));
        let mut rescan = interval_at(Instant::now() + rescan_every, rescan_every);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 1;

        loop {
            let result = tokio::select! {
                _ = health.tick() => {
                    let result = coordinator.check_all(tick).await;
                    tick += 1;
                    result
                }
                _ = rescan.tick() => coordinator.rescan_due(),
                msg = rx.recv() => match msg {
                    Some(msg) => coordinator.handle(msg).await,
                    None => break,
                },
                _ = stop.changed() => break,
            };

            if let Err(e) = result {
                shutdown.fatal(format!("Root coordinator failed: {}", e));
                break;
            }
        }
        debug!("Root coordinator stopped");
    })
}

/// The single scan loop: one root at a time, on the blocking pool.
pub fn spawn_scan_loop(
    scanner: Arc<Scanner>,
    coordinator: Arc<Coordinator>,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        let scheduler = coordinator.scheduler.clone();
        let roots = coordinator.roots.clone();
        let aggregator = coordinator.aggregator.clone();

        loop {
            if *stop.borrow() {
                break;
            }
            let root_id = tokio::select! {
                root_id = scheduler.next_scan() => root_id,
                _ = stop.changed() => break,
            };

            let root = match roots.get_root(root_id) {
                Ok(root) => root,
                Err(e) => {
                    scheduler.scan_done(root_id);
                    if e.is_fatal() {
                        shutdown.fatal(format!("Cannot load root {}: {}", root_id, e));
                        break;
                    }
                    continue;
                }
            };
            if !roots.is_online(root_id) {
                debug!(root_id, "Root went offline before its scan started");
                scheduler.scan_done(root_id);
                continue;
            }

            let ctx = RootScanContext {
                root,
                online: roots.online_flag(root_id),
            };
            let task_scanner = scanner.clone();
            let result = tokio::task::spawn_blocking(move || task_scanner.scan(&ctx)).await;
            scheduler.scan_done(root_id);

            match result {
                Ok(Ok(report)) => {
                    aggregator.scan_finished(
                        root_id,
                        report.wave.found(),
                        report.wave.had_errors(),
                        scheduler.queue_len(),
                    );
                    if report.root_unavailable {
                        let recorded = roots
                            .record_root_error(root_id, "Root became unavailable during scan");
                        if let Err(e) = recorded {
                            shutdown.fatal(format!("Cannot record error for root {}: {}", root_id, e));
                            break;
                        }
                        scheduler.request_health_check(root_id);
                    } else if report.cancelled {
                        info!(root_id, "Scan cancelled");
                    }
                }
                Ok(Err(e)) => {
                    aggregator.scan_finished(root_id, 0, true, scheduler.queue_len());
                    if e.is_fatal() {
                        shutdown.fatal(format!("Scan of root {} failed: {}", root_id, e));
                        break;
                    }
                    warn!(root_id, error = %e, "Scan failed");
                    if let Err(e) = roots.record_root_error(root_id, &e.to_string()) {
                        shutdown.fatal(format!("Cannot record error for root {}: {}", root_id, e));
                        break;
                    }
                }
                Err(e) => {
                    aggregator.scan_finished(root_id, 0, true, scheduler.queue_len());
                    error!(root_id, error = %e, "Scan task panicked");
                }
            }
        }
        debug!("Scan loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RootsConfig;
    use crate::db::Catalog;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_transitions_drive_scans() {
        let dir = tempdir().unwrap();
        let photos = dir.path().join("photos");
        fs::create_dir(&photos).unwrap();

        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let roots = Arc::new(RootManager::new(catalog.clone(), RootsConfig::default()));
        let aggregator = Arc::new(StatusAggregator::new(catalog.clone()));
        let (scheduler, _rx) = ScanScheduler::new(roots.clone(), aggregator.clone());
        let coordinator = Coordinator::new(roots.clone(), Arc::new(scheduler), aggregator, None);

        let root = roots.add_root(&photos).unwrap();

        // First check: Unknown -> Online, scan queued
        let t = coordinator.check_root(root.id).await.unwrap().unwrap();
        assert_eq!((t.from, t.to, t.scan), (RootStatus::Unknown, RootStatus::Online, true));
        assert_eq!(coordinator.scheduler.queue_len(), 1);

        // Steady state: nothing to report, nothing queued twice
        assert!(coordinator.check_root(root.id).await.unwrap().is_none());
        assert_eq!(coordinator.scheduler.queue_len(), 1);

        // Eject
        fs::rename(&photos, dir.path().join("elsewhere")).unwrap();
        let t = coordinator.check_root(root.id).await.unwrap().unwrap();
        assert_eq!(t.to, RootStatus::Offline);
        assert_eq!(catalog.get_root(root.id).unwrap().unwrap().status, RootStatus::Offline);

        // Reattach
        fs::rename(dir.path().join("elsewhere"), &photos).unwrap();
        let t = coordinator.check_root(root.id).await.unwrap().unwrap();
        assert_eq!((t.from, t.to, t.scan), (RootStatus::Offline, RootStatus::Online, true));
        assert_eq!(coordinator.scheduler.queue_len(), 1);
    }
}
