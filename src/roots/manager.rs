use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use super::health::{next_status, probe, Probe};
use super::{Root, Transition};
use crate::config::RootsConfig;
use crate::db::{Catalog, RootId, RootStatus};
use crate::error::{Error, Result};

const ROOT_ERROR_THROTTLE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct ManagerState {
    /// Roots checked at least once by this process.
    checked: HashSet<RootId>,
    /// Cooperative cancellation flag per root. Replaced on every transition
    /// into Online, so tasks from an earlier online period stay stale.
    online: HashMap<RootId, Arc<AtomicBool>>,
    last_error_at: HashMap<RootId, Instant>,
}

/// Owns root registration and status transitions. Transitions are
/// serialized; the filesystem probe runs outside the lock.
pub struct RootManager {
    catalog: Arc<Catalog>,
    config: RootsConfig,
    state: Mutex<ManagerState>,
}

impl RootManager {
    pub fn new(catalog: Arc<Catalog>, config: RootsConfig) -> Self {
        Self {
            catalog,
            config,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Register a directory. The path is canonicalized before the duplicate check.
    pub fn add_root(&self, path: &Path) -> Result<Root> {
        let canonical = path.canonicalize().map_err(|e| Error::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(Error::InvalidPath {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let root = self.catalog.insert_root(&canonical)?;
        info!(root_id = root.id, path = %canonical.display(), "Root added");
        Ok(root)
    }

    pub fn list_roots(&self) -> Result<Vec<Root>> {
        self.catalog.list_roots()
    }

    pub fn get_root(&self, root_id: RootId) -> Result<Root> {
        self.catalog
            .get_root(root_id)?
            .ok_or(Error::UnknownRoot(root_id))
    }

    /// The current cancellation flag for a root; false unless it is online.
    pub fn online_flag(&self, root_id: RootId) -> Arc<AtomicBool> {
        self.state
            .lock()
            .online
            .entry(root_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn is_online(&self, root_id: RootId) -> bool {
        self.state
            .lock()
            .online
            .get(&root_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Probe a root and apply the resulting transition. Blocking.
    ///
    /// Returns `None` when nothing changed and no scan is due.
    pub fn check_health(&self, root_id: RootId) -> Result<Option<Transition>> {
        let root = self.get_root(root_id)?;
        let probe = probe(&root.path, self.config.probe_attempts);

        let mut state = self.state.lock();
        // Re-read under the lock; a concurrent check may have moved it already
        let prev = self
            .catalog
            .get_root(root_id)?
            .map(|r| r.status)
            .ok_or(Error::UnknownRoot(root_id))?;
        let first_check = state.checked.insert(root_id);
        let (next, scan) = next_status(prev, first_check, probe.is_accessible());

        match (&probe, next) {
            (Probe::Accessible, RootStatus::Online) => {
                if prev != RootStatus::Online || first_check {
                    self.catalog.set_root_status(root_id, RootStatus::Online)?;
                    state
                        .online
                        .insert(root_id, Arc::new(AtomicBool::new(true)));
                } else {
                    self.catalog.touch_root_seen(root_id)?;
                }
            }
            (Probe::Inaccessible(reason), _) => {
                if let Some(flag) = state.online.get(&root_id) {
                    flag.store(false, Ordering::SeqCst);
                }
                if prev != next {
                    self.catalog.set_root_status(root_id, next)?;
                    self.catalog.set_root_error(root_id, reason)?;
                }
            }
            (Probe::Accessible, _) => {}
        }

        if prev != next {
            info!(
                root_id,
                path = %root.path.display(),
                from = prev.as_str(),
                to = next.as_str(),
                "Root status changed"
            );
        }

        if prev == next && !scan {
            return Ok(None);
        }
        Ok(Some(Transition {
            root_id,
            from: prev,
            to: next,
            scan,
        }))
    }

    /// Record a root-level error, at most once per throttle window.
    pub fn record_root_error(&self, root_id: RootId, error: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if let Some(last) = state.last_error_at.get(&root_id) {
                if now.duration_since(*last) < ROOT_ERROR_THROTTLE {
                    return Ok(());
                }
            }
            state.last_error_at.insert(root_id, now);
        }

        self.catalog.set_root_error(root_id, error)
    }

    pub fn config(&self) -> &RootsConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manager() -> RootManager {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        RootManager::new(
            catalog,
            RootsConfig {
                probe_attempts: 1,
                ..RootsConfig::default()
            },
        )
    }

    #[test]
    fn test_add_root_validates_and_canonicalizes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();

        let nested = dir.path().join("photos");
        fs::create_dir(&nested).unwrap();
        let root = manager.add_root(&nested.join("..").join("photos")).unwrap();
        assert_eq!(root.path, nested.canonicalize().unwrap());
        assert_eq!(root.status, RootStatus::Unknown);

        assert!(matches!(manager.add_root(&nested), Err(Error::DuplicateRoot(_))));
        assert!(matches!(
            manager.add_root(&dir.path().join("nope")),
            Err(Error::InvalidPath { .. })
        ));

        let file = dir.path().join("file.jpg");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(manager.add_root(&file), Err(Error::InvalidPath { .. })));
    }

    #[test]
    fn test_eject_and_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive");
        fs::create_dir(&path).unwrap();
        let manager = manager();
        let root = manager.add_root(&path).unwrap();

        let t = manager.check_health(root.id).unwrap().unwrap();
        assert_eq!((t.from, t.to, t.scan), (RootStatus::Unknown, RootStatus::Online, true));
        let flag = manager.online_flag(root.id);
        assert!(flag.load(Ordering::SeqCst));

        // Steady state: nothing to report
        assert!(manager.check_health(root.id).unwrap().is_none());

        fs::rename(&path, dir.path().join("elsewhere")).unwrap();
        let t = manager.check_health(root.id).unwrap().unwrap();
        assert_eq!((t.to, t.scan), (RootStatus::Offline, false));
        assert!(!flag.load(Ordering::SeqCst));
        let stored = manager.get_root(root.id).unwrap();
        assert_eq!(stored.status, RootStatus::Offline);
        assert!(stored.last_error.is_some());

        fs::rename(dir.path().join("elsewhere"), &path).unwrap();
        let t = manager.check_health(root.id).unwrap().unwrap();
        assert_eq!((t.from, t.to, t.scan), (RootStatus::Offline, RootStatus::Online, true));
        // The old flag stays cancelled; a fresh one is handed out
        assert!(!flag.load(Ordering::SeqCst));
        assert!(manager.online_flag(root.id).load(Ordering::SeqCst));
    }

    #[test]
    fn test_never_present_root_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        fs::create_dir(&path).unwrap();
        let manager = manager();
        let root = manager.add_root(&path).unwrap();
        fs::remove_dir(&path).unwrap();

        let t = manager.check_health(root.id).unwrap().unwrap();
        assert_eq!(t.to, RootStatus::Missing);
        assert!(!manager.is_online(root.id));
    }

    #[test]
    fn test_root_error_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        let root = manager.add_root(dir.path()).unwrap();

        manager.record_root_error(root.id, "first").unwrap();
        manager.record_root_error(root.id, "second").unwrap();
        assert_eq!(
            manager.get_root(root.id).unwrap().last_error.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_root_error_write_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.db");
        let photos = dir.path().join("photos");
        fs::create_dir(&photos).unwrap();
        let manager = RootManager::new(
            Arc::new(Catalog::open(&db_path).unwrap()),
            RootsConfig::default(),
        );
        let root = manager.add_root(&photos).unwrap();

        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("DROP TABLE roots")
            .unwrap();

        let err = manager.record_root_error(root.id, "walk failed").unwrap_err();
        assert!(err.is_fatal());
    }
}
