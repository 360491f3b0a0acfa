//! Root rows and their lifecycle bookkeeping.

use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{parse_column, Catalog, RootId, RootStatus};
use crate::error::{Error, Result};

/// A tracked top-level directory, in the shape the root listing exposes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Root {
    pub id: RootId,
    pub path: PathBuf,
    pub status: RootStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_scan_started_at: Option<DateTime<Utc>>,
    pub last_scan_enumerated_at: Option<DateTime<Utc>>,
    pub last_scan_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

const ROOT_COLUMNS: &str = "id, path, status, last_seen_at, last_scan_started_at, \
     last_scan_enumerated_at, last_scan_finished_at, last_error";

fn root_from_row(row: &Row<'_>) -> rusqlite::Result<Root> {
    let path: String = row.get(1)?;
    Ok(Root {
        id: row.get(0)?,
        path: PathBuf::from(path),
        status: parse_column(2, row.get(2)?, RootStatus::from_str)?,
        last_seen_at: row.get(3)?,
        last_scan_started_at: row.get(4)?,
        last_scan_enumerated_at: row.get(5)?,
        last_scan_finished_at: row.get(6)?,
        last_error: row.get(7)?,
    })
}

impl Catalog {
    /// Insert a root in the `Unknown` state. `path` must already be canonical.
    pub fn insert_root(&self, path: &Path) -> Result<Root> {
        let path_str = path.to_string_lossy();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO roots (path, status, added_at) VALUES (?, ?, ?)",
            params![path_str, RootStatus::Unknown.as_str(), Utc::now()],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(Error::DuplicateRoot(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        let root = conn.query_row(
            &format!("SELECT {} FROM roots WHERE id = ?", ROOT_COLUMNS),
            [id],
            root_from_row,
        )?;
        Ok(root)
    }

    pub fn get_root(&self, id: RootId) -> Result<Option<Root>> {
        let conn = self.conn.lock();
        let root = conn
            .query_row(
                &format!("SELECT {} FROM roots WHERE id = ?", ROOT_COLUMNS),
                [id],
                root_from_row,
            )
            .optional()?;
        Ok(root)
    }

    pub fn list_roots(&self) -> Result<Vec<Root>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM roots ORDER BY id", ROOT_COLUMNS))?;
        let roots = stmt
            .query_map([], root_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roots)
    }

    /// Record a health-check outcome. Going online stamps `last_seen_at` and clears the error.
    pub fn set_root_status(&self, id: RootId, status: RootStatus) -> Result<()> {
        let conn = self.conn.lock();
        if status == RootStatus::Online {
            conn.execute(
                "UPDATE roots SET status = ?, last_seen_at = ?, last_error = NULL WHERE id = ?",
                params![status.as_str(), Utc::now(), id],
            )?;
        } else {
            conn.execute(
                "UPDATE roots SET status = ? WHERE id = ?",
                params![status.as_str(), id],
            )?;
        }
        Ok(())
    }

    pub fn touch_root_seen(&self, id: RootId) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE roots SET last_seen_at = ? WHERE id = ?",
            params![Utc::now(), id],
        )?;
        Ok(())
    }

    pub fn mark_scan_started(&self, id: RootId, at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE roots SET last_scan_started_at = ?, last_error = NULL WHERE id = ?",
            params![at, id],
        )?;
        Ok(())
    }

    pub fn mark_scan_enumerated(&self, id: RootId, at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE roots SET last_scan_enumerated_at = ? WHERE id = ?",
            params![at, id],
        )?;
        Ok(())
    }

    pub fn mark_scan_finished(&self, id: RootId, at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE roots SET last_scan_finished_at = ? WHERE id = ?",
            params![at, id],
        )?;
        Ok(())
    }

    pub fn set_root_error(&self, id: RootId, error: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE roots SET last_error = ? WHERE id = ?",
            params![error, id],
        )?;
        Ok(())
    }

    /// Returns `(total, online)`.
    pub fn count_roots(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'online'), 0) FROM roots",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_root_is_rejected() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/photos/a")).unwrap();
        assert_eq!(root.status, RootStatus::Unknown);
        assert!(root.last_seen_at.is_none());

        match catalog.insert_root(Path::new("/photos/a")) {
            Err(Error::DuplicateRoot(path)) => assert_eq!(path, PathBuf::from("/photos/a")),
            other => panic!("expected DuplicateRoot, got {:?}", other),
        }
    }

    #[test]
    fn test_status_transitions_and_counts() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog.insert_root(Path::new("/a")).unwrap();
        let b = catalog.insert_root(Path::new("/b")).unwrap();

        catalog.set_root_error(a.id, "boom").unwrap();
        catalog.set_root_status(a.id, RootStatus::Online).unwrap();
        catalog.set_root_status(b.id, RootStatus::Missing).unwrap();

        let a = catalog.get_root(a.id).unwrap().unwrap();
        assert_eq!(a.status, RootStatus::Online);
        assert!(a.last_seen_at.is_some());
        assert!(a.last_error.is_none());

        assert_eq!(catalog.count_roots().unwrap(), (2, 1));
        assert!(catalog.get_root(999).unwrap().is_none());
    }

    #[test]
    fn test_scan_bookkeeping_timestamps() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/a")).unwrap();
        let now = Utc::now();

        catalog.set_root_error(root.id, "stale").unwrap();
        catalog.mark_scan_started(root.id, now).unwrap();
        catalog.mark_scan_enumerated(root.id, now).unwrap();

        let root = catalog.get_root(root.id).unwrap().unwrap();
        assert_eq!(root.last_scan_started_at, Some(now));
        assert_eq!(root.last_scan_enumerated_at, Some(now));
        assert!(root.last_scan_finished_at.is_none());
        assert!(root.last_error.is_none());
    }
}
