use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::RootId;
use crate::error::{Error, Result};

type WatchedRoots = Arc<RwLock<Vec<(RootId, PathBuf)>>>;

/// OS file-event subscription over every online root.
///
/// Events are debounced, mapped to the root they fall under and forwarded as
/// root ids. Delivery is best effort: when the channel is full the event is
/// dropped, the periodic rescan covers it.
pub struct ChangeDetector {
    debouncer: Mutex<Debouncer<RecommendedWatcher, FileIdMap>>,
    roots: WatchedRoots,
}

impl ChangeDetector {
    pub fn new(debounce: Duration, tx: mpsc::Sender<RootId>) -> Result<Self> {
        let roots: WatchedRoots = Arc::new(RwLock::new(Vec::new()));
        let lookup = roots.clone();

        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "File watcher error");
                    }
                    return;
                }
            };

            let mut touched = HashSet::new();
            {
                let roots = lookup.read();
                for event in events.iter().filter(|e| !matches!(e.kind, EventKind::Access(_))) {
                    for path in &event.paths {
                        if let Some(root_id) = owning_root(&roots, path) {
                            touched.insert(root_id);
                        }
                    }
                }
            }

            for root_id in touched {
                if tx.try_send(root_id).is_err() {
                    debug!(root_id, "Dropped file activity notification");
                }
            }
        })
        .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to create file watcher: {}", e))))?;

        Ok(Self {
            debouncer: Mutex::new(debouncer),
            roots,
        })
    }

    /// Start watching a root. Watching an already watched root is a no-op.
    pub fn watch(&self, root_id: RootId, path: &Path) -> Result<()> {
        if self.roots.read().iter().any(|(id, _)| *id == root_id) {
            return Ok(());
        }

        self.debouncer
            .lock()
            .watcher()
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "Failed to watch {}: {}",
                    path.display(),
                    e
                )))
            })?;
        self.roots.write().push((root_id, path.to_path_buf()));
        debug!(root_id, path = %path.display(), "Watching root");
        Ok(())
    }

    /// Stop watching a root. The path may already be gone.
    pub fn unwatch(&self, root_id: RootId) {
        let removed = {
            let mut roots = self.roots.write();
            roots
                .iter()
                .position(|(id, _)| *id == root_id)
                .map(|i| roots.remove(i).1)
        };

        if let Some(path) = removed {
            if let Err(e) = self.debouncer.lock().watcher().unwatch(&path) {
                debug!(root_id, error = %e, "Unwatch failed");
            }
        }
    }

    pub fn is_watching(&self, root_id: RootId) -> bool {
        self.roots.read().iter().any(|(id, _)| *id == root_id)
    }
}

/// The most specific watched root containing `path`.
fn owning_root(roots: &[(RootId, PathBuf)], path: &Path) -> Option<RootId> {
    roots
        .iter()
        .filter(|(_, root)| path.starts_with(root))
        .max_by_key(|(_, root)| root.components().count())
        .map(|(id, _)| *id)
}
