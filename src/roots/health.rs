use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::db::RootStatus;
use crate::media::is_transient_io;

const PROBE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Accessible,
    Inaccessible(String),
}

impl Probe {
    pub fn is_accessible(&self) -> bool {
        matches!(self, Probe::Accessible)
    }
}

/// Check that `path` is a readable directory.
///
/// `NotFound` is final at once. Other errors are retried up to `attempts`
/// times with a growing pause, so a briefly busy device is not taken offline.
pub fn probe(path: &Path, attempts: u32) -> Probe {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match probe_once(path) {
            Ok(()) => return Probe::Accessible,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Probe::Inaccessible(format!("{}: not found", path.display()));
            }
            Err(e) => {
                last_error = format!("{}: {}", path.display(), e);
                let retry = attempt + 1 < attempts;
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    transient = is_transient_io(&e),
                    retry,
                    "Root probe failed"
                );
                if retry {
                    thread::sleep(PROBE_BACKOFF * (attempt + 1));
                }
            }
        }
    }

    Probe::Inaccessible(last_error)
}

fn probe_once(path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Err(std::io::Error::new(ErrorKind::NotFound, "not a directory"));
    }
    std::fs::read_dir(path)?;
    Ok(())
}

/// State machine for root status. Returns the new status and whether a scan
/// should be requested.
///
/// `first_check` is true for the first check of a root in this process, so a
/// root that was already online before a restart is rescanned once and any
/// interrupted wave is resumed.
pub fn next_status(prev: RootStatus, first_check: bool, accessible: bool) -> (RootStatus, bool) {
    match (prev, accessible) {
        (RootStatus::Unknown, true)
        | (RootStatus::Missing, true)
        | (RootStatus::Offline, true) => (RootStatus::Online, true),
        (RootStatus::Online, true) => (RootStatus::Online, first_check),
        (RootStatus::Unknown, false) | (RootStatus::Missing, false) => (RootStatus::Missing, false),
        (RootStatus::Online, false) | (RootStatus::Offline, false) => (RootStatus::Offline, false),
    }
}
