//! Photo rows: point lookups by `(root_id, rel_path)`, range scans by root, upserts.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{
    embedding_to_bytes, parse_column, Catalog, DateSource, EmbeddingState, PhotoId, RootId,
    ThumbnailState,
};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub root_id: RootId,
    pub rel_path: String,
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub fingerprint: String,
    pub date_taken: Option<DateTime<Utc>>,
    pub date_source: Option<DateSource>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub thumbnail_state: ThumbnailState,
    pub embedding_state: EmbeddingState,
    pub embedding_model: Option<String>,
    pub failed: bool,
    pub last_failed_error: Option<String>,
    pub indexed_at: Option<DateTime<Utc>>,
}

/// Fields written by the ingest worker's catalog step.
#[derive(Debug, Clone)]
pub struct PhotoUpsert<'a> {
    pub root_id: RootId,
    pub rel_path: &'a str,
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub fingerprint: &'a str,
    pub date_taken: DateTime<Utc>,
    pub date_source: DateSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: PhotoId,
    pub created: bool,
    /// The row existed with a different fingerprint; derived state was reset.
    pub fingerprint_changed: bool,
}

const PHOTO_COLUMNS: &str = "id, root_id, rel_path, size_bytes, mtime_ns, fingerprint, \
     date_taken, date_source, width, height, thumbnail_state, embedding_state, embedding_model, \
     failed, last_failed_error, indexed_at";

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<PhotoRecord> {
    let date_source: Option<String> = row.get(7)?;
    Ok(PhotoRecord {
        id: row.get(0)?,
        root_id: row.get(1)?,
        rel_path: row.get(2)?,
        size_bytes: row.get(3)?,
        mtime_ns: row.get(4)?,
        fingerprint: row.get(5)?,
        date_taken: row.get(6)?,
        date_source: date_source.as_deref().and_then(DateSource::from_str),
        width: row.get(8)?,
        height: row.get(9)?,
        thumbnail_state: parse_column(10, row.get(10)?, ThumbnailState::from_str)?,
        embedding_state: parse_column(11, row.get(11)?, EmbeddingState::from_str)?,
        embedding_model: row.get(12)?,
        failed: row.get(13)?,
        last_failed_error: row.get(14)?,
        indexed_at: row.get(15)?,
    })
}

impl Catalog {
    pub fn get_photo(&self, id: PhotoId) -> Result<Option<PhotoRecord>> {
        let conn = self.conn.lock();
        let photo = conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS),
                [id],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn photo_by_key(&self, root_id: RootId, rel_path: &str) -> Result<Option<PhotoRecord>> {
        let conn = self.conn.lock();
        let photo = conn
            .query_row(
                &format!(
                    "SELECT {} FROM photos WHERE root_id = ? AND rel_path = ?",
                    PHOTO_COLUMNS
                ),
                params![root_id, rel_path],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn photos_in_root(&self, root_id: RootId) -> Result<Vec<PhotoRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM photos WHERE root_id = ? ORDER BY rel_path",
            PHOTO_COLUMNS
        ))?;
        let photos = stmt
            .query_map([root_id], photo_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    /// Insert or update a photo. A changed fingerprint resets thumbnail and
    /// embedding state and drops the stored vector; an unchanged one only
    /// refreshes the date fields, so repeating the call is a no-op.
    pub fn upsert_photo(&self, photo: &PhotoUpsert<'_>) -> Result<UpsertOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<(PhotoId, String)> = tx
            .query_row(
                "SELECT id, fingerprint FROM photos WHERE root_id = ? AND rel_path = ?",
                params![photo.root_id, photo.rel_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO photos (root_id, rel_path, size_bytes, mtime_ns, fingerprint,
                                        date_taken, date_source)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        photo.root_id,
                        photo.rel_path,
                        photo.size_bytes,
                        photo.mtime_ns,
                        photo.fingerprint,
                        photo.date_taken,
                        photo.date_source.as_str(),
                    ],
                )?;
                UpsertOutcome {
                    id: tx.last_insert_rowid(),
                    created: true,
                    fingerprint_changed: false,
                }
            }
            Some((id, fingerprint)) if fingerprint != photo.fingerprint => {
                tx.execute(
                    r#"
                    UPDATE photos
                    SET size_bytes = ?, mtime_ns = ?, fingerprint = ?,
                        date_taken = ?, date_source = ?,
                        width = NULL, height = NULL,
                        thumbnail_state = 'pending', embedding_state = 'pending',
                        embedding_model = NULL, indexed_at = NULL
                    WHERE id = ?
                    "#,
                    params![
                        photo.size_bytes,
                        photo.mtime_ns,
                        photo.fingerprint,
                        photo.date_taken,
                        photo.date_source.as_str(),
                        id,
                    ],
                )?;
                tx.execute("DELETE FROM embeddings WHERE photo_id = ?", [id])?;
                UpsertOutcome {
                    id,
                    created: false,
                    fingerprint_changed: true,
                }
            }
            Some((id, _)) => {
                tx.execute(
                    "UPDATE photos SET date_taken = ?, date_source = ? WHERE id = ?",
                    params![photo.date_taken, photo.date_source.as_str(), id],
                )?;
                UpsertOutcome {
                    id,
                    created: false,
                    fingerprint_changed: false,
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// False when the row no longer exists.
    pub fn set_thumbnail_state(
        &self,
        id: PhotoId,
        state: ThumbnailState,
        dimensions: Option<(u32, u32)>,
    ) -> Result<bool> {
        let (width, height) = match dimensions {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        let updated = self.conn.lock().execute(
            r#"
            UPDATE photos
            SET thumbnail_state = ?, width = COALESCE(?, width), height = COALESCE(?, height)
            WHERE id = ?
            "#,
            params![state.as_str(), width, height, id],
        )?;
        Ok(updated > 0)
    }

    /// Store the vector and flip the photo to `complete` in one transaction.
    /// False, with nothing written, when the row was deleted meanwhile.
    pub fn set_embedding_complete(&self, id: PhotoId, vector: &[f32], model: &str) -> Result<bool> {
        let bytes = embedding_to_bytes(vector);
        let now = Utc::now();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            r#"
            UPDATE photos
            SET embedding_state = 'complete', embedding_model = ?, indexed_at = ?
            WHERE id = ?
            "#,
            params![model, now, id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            r#"
            INSERT OR REPLACE INTO embeddings (photo_id, embedding, embedding_dim, model_name, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![id, bytes, vector.len() as i64, model, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn set_embedding_state(&self, id: PhotoId, state: EmbeddingState) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE photos SET embedding_state = ? WHERE id = ?",
            params![state.as_str(), id],
        )?;
        Ok(())
    }

    pub fn mark_photo_failed(&self, id: PhotoId, error: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE photos SET failed = 1, last_failed_error = ? WHERE id = ?",
            params![error, id],
        )?;
        Ok(())
    }

    pub fn clear_photo_failure(&self, id: PhotoId) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE photos SET failed = 0, last_failed_error = NULL WHERE id = ? AND failed = 1",
            [id],
        )?;
        Ok(())
    }

    /// Delete a photo row; its stored vector goes with it.
    pub fn delete_photo(&self, id: PhotoId) -> Result<bool> {
        let deleted = self.conn.lock().execute("DELETE FROM photos WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }

    /// Returns `(photos_total, photos_indexed)`, indexed meaning the embedding is complete.
    pub fn count_photos(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(embedding_state = 'complete'), 0) FROM photos",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }

    pub fn count_failed_photos(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM photos WHERE failed = 1", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn upsert<'a>(root_id: RootId, rel_path: &'a str, fingerprint: &'a str) -> PhotoUpsert<'a> {
        PhotoUpsert {
            root_id,
            rel_path,
            size_bytes: 10,
            mtime_ns: 1_000,
            fingerprint,
            date_taken: Utc::now(),
            date_source: DateSource::Mtime,
        }
    }

    #[test]
    fn test_upsert_is_idempotent_for_same_fingerprint() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();

        let first = catalog.upsert_photo(&upsert(root.id, "a.jpg", "fp1")).unwrap();
        assert!(first.created);

        catalog.set_embedding_complete(first.id, &[1.0, 0.0], "m").unwrap();
        let second = catalog.upsert_photo(&upsert(root.id, "a.jpg", "fp1")).unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.created);
        assert!(!second.fingerprint_changed);

        let photo = catalog.get_photo(first.id).unwrap().unwrap();
        assert_eq!(photo.embedding_state, EmbeddingState::Complete);
        assert_eq!(catalog.count_photos().unwrap(), (1, 1));
    }

    #[test]
    fn test_changed_fingerprint_resets_derived_state() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();

        let id = catalog.upsert_photo(&upsert(root.id, "a.jpg", "fp1")).unwrap().id;
        catalog
            .set_thumbnail_state(id, ThumbnailState::Complete, Some((640, 480)))
            .unwrap();
        catalog.set_embedding_complete(id, &[1.0, 0.0], "m").unwrap();

        let outcome = catalog.upsert_photo(&upsert(root.id, "a.jpg", "fp2")).unwrap();
        assert_eq!(outcome.id, id);
        assert!(outcome.fingerprint_changed);

        let photo = catalog.get_photo(id).unwrap().unwrap();
        assert_eq!(photo.thumbnail_state, ThumbnailState::Pending);
        assert_eq!(photo.embedding_state, EmbeddingState::Pending);
        assert!(photo.width.is_none());
        assert!(catalog.embedding(id).unwrap().is_none());
    }

    #[test]
    fn test_failure_flag_and_delete() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();
        let id = catalog.upsert_photo(&upsert(root.id, "sub/b.png", "fp")).unwrap().id;

        catalog.mark_photo_failed(id, "decode error").unwrap();
        let photo = catalog.photo_by_key(root.id, "sub/b.png").unwrap().unwrap();
        assert!(photo.failed);
        assert_eq!(photo.last_failed_error.as_deref(), Some("decode error"));
        assert_eq!(catalog.count_failed_photos().unwrap(), 1);

        catalog.clear_photo_failure(id).unwrap();
        assert!(!catalog.get_photo(id).unwrap().unwrap().failed);

        catalog.set_embedding_complete(id, &[0.5, 0.5], "m").unwrap();
        assert!(catalog.delete_photo(id).unwrap());
        assert!(catalog.photos_in_root(root.id).unwrap().is_empty());
        assert!(catalog.embedding(id).unwrap().is_none());
    }

    #[test]
    fn test_writes_to_deleted_photo_are_reported_not_errors() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(Path::new("/r")).unwrap();
        let id = catalog.upsert_photo(&upsert(root.id, "gone.jpg", "fp")).unwrap().id;
        assert!(catalog.delete_photo(id).unwrap());

        assert!(!catalog.set_embedding_complete(id, &[1.0, 0.0], "m").unwrap());
        assert!(catalog.embedding(id).unwrap().is_none());
        assert!(!catalog
            .set_thumbnail_state(id, ThumbnailState::Complete, Some((1, 1)))
            .unwrap());
        assert_eq!(catalog.count_photos().unwrap(), (0, 0));
    }
}
