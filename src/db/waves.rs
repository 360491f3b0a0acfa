use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{Catalog, RootId};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct WaveRecord {
    pub id: i64,
    pub root_id: RootId,
    pub started_at: DateTime<Utc>,
    pub found: u64,
    pub enqueued: u64,
    pub processed: u64,
    pub finished_at: Option<DateTime<Utc>>,
    pub had_errors: bool,
}

impl Catalog {
    pub fn start_wave(&self, root_id: RootId, at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scan_waves (root_id, started_at) VALUES (?, ?)",
            params![root_id, at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_wave(&self, wave_id: i64, found: u64, enqueued: u64, processed: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE scan_waves SET found = ?, enqueued = ?, processed = ? WHERE id = ?",
            params![found as i64, enqueued as i64, processed as i64, wave_id],
        )?;
        Ok(())
    }

    pub fn finish_wave(
        &self,
        wave_id: i64,
        (found, enqueued, processed): (u64, u64, u64),
        had_errors: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.lock().execute(
            r#"
            UPDATE scan_waves
            SET found = ?, enqueued = ?, processed = ?, had_errors = ?, finished_at = ?
            WHERE id = ? AND finished_at IS NULL
            "#,
            params![found as i64, enqueued as i64, processed as i64, had_errors, at, wave_id],
        )?;
        Ok(())
    }

    /// Close waves left open by an interrupted process. They count as errored.
    pub fn abandon_open_waves(&self, at: DateTime<Utc>) -> Result<usize> {
        let closed = self.conn.lock().execute(
            "UPDATE scan_waves SET had_errors = 1, finished_at = ? WHERE finished_at IS NULL",
            params![at],
        )?;
        Ok(closed)
    }

    pub fn last_wave(&self, root_id: RootId) -> Result<Option<WaveRecord>> {
        let conn = self.conn.lock();
        let wave = conn
            .query_row(
                r#"
                SELECT id, root_id, started_at, found, enqueued, processed, finished_at, had_errors
                FROM scan_waves WHERE root_id = ? ORDER BY id DESC LIMIT 1
                "#,
                [root_id],
                |row| {
                    Ok(WaveRecord {
                        id: row.get(0)?,
                        root_id: row.get(1)?,
                        started_at: row.get(2)?,
                        found: row.get::<_, i64>(3)? as u64,
                        enqueued: row.get::<_, i64>(4)? as u64,
                        processed: row.get::<_, i64>(5)? as u64,
                        finished_at: row.get(6)?,
                        had_errors: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(wave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_wave_lifecycle() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();

        let wave = catalog.start_wave(root.id, Utc::now()).unwrap();
        catalog.update_wave(wave, 5, 3, 1).unwrap();
        let open = catalog.last_wave(root.id).unwrap().unwrap();
        assert_eq!((open.found, open.enqueued, open.processed), (5, 3, 1));
        assert!(open.finished_at.is_none());

        catalog.finish_wave(wave, (5, 3, 3), false, Utc::now()).unwrap();
        let done = catalog.last_wave(root.id).unwrap().unwrap();
        assert_eq!(done.processed, 3);
        assert!(done.finished_at.is_some());
        assert!(!done.had_errors);

        // A finished wave is not reopened or rewritten.
        catalog.finish_wave(wave, (9, 9, 9), true, Utc::now()).unwrap();
        assert_eq!(catalog.last_wave(root.id).unwrap().unwrap().found, 5);
    }

    #[test]
    fn test_abandon_open_waves() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();
        catalog.start_wave(root.id, Utc::now()).unwrap();

        assert_eq!(catalog.abandon_open_waves(Utc::now()).unwrap(), 1);
        let wave = catalog.last_wave(root.id).unwrap().unwrap();
        assert!(wave.had_errors);
        assert!(wave.finished_at.is_some());
    }
}
