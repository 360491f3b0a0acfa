//! Embedding storage. The vectors here are the source for index rebuilds,
//! compaction and reconciliation.

use rusqlite::{params, OptionalExtension};

use super::{Catalog, PhotoId};
use crate::error::Result;

impl Catalog {
    pub fn embedding(&self, photo_id: PhotoId) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM embeddings WHERE photo_id = ?",
                [photo_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.map(|b| bytes_to_embedding(&b)))
    }

    /// Ids of photos whose embedding is complete for `model`.
    pub fn complete_embedding_ids(&self, model: &str) -> Result<Vec<PhotoId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM photos WHERE embedding_state = 'complete' AND embedding_model = ? ORDER BY id",
        )?;
        let ids = stmt
            .query_map([model], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Complete vectors for `model`, the input for a from-catalog rebuild.
    pub fn embeddings_for_model(&self, model: &str) -> Result<Vec<(PhotoId, Vec<f32>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT e.photo_id, e.embedding
            FROM embeddings e
            JOIN photos p ON p.id = e.photo_id
            WHERE p.embedding_state = 'complete' AND e.model_name = ?
            ORDER BY e.photo_id
            "#,
        )?;
        let records = stmt
            .query_map([model], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_embedding(&bytes)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Put photos back to `pending` so the next scan re-enqueues them.
    pub fn mark_embeddings_pending(&self, ids: &[PhotoId]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE photos SET embedding_state = 'pending', indexed_at = NULL WHERE id = ?",
            )?;
            for id in ids {
                updated += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Demote completions produced by a different model and drop their vectors.
    pub fn reset_other_model_embeddings(&self, model: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            DELETE FROM embeddings
            WHERE model_name != ?
            "#,
            [model],
        )?;
        let updated = tx.execute(
            r#"
            UPDATE photos
            SET embedding_state = 'pending', embedding_model = NULL, indexed_at = NULL
            WHERE embedding_state = 'complete' AND (embedding_model IS NULL OR embedding_model != ?)
            "#,
            params![model],
        )?;
        tx.commit()?;
        Ok(updated)
    }
}

/// Convert embedding vector to bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert bytes back to embedding vector
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
