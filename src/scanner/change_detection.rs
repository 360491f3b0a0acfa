//! Classification of an enumerated file against its catalog row.

use serde::Serialize;

use super::Fingerprint;
use crate::db::{EmbeddingState, PhotoRecord, ThumbnailState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// No catalog row yet.
    New,
    /// Catalog row with a different fingerprint.
    Changed,
    /// Same fingerprint, but a previous ingest left work undone or the
    /// embedding failed.
    Retry,
    Unchanged,
}

impl ChangeKind {
    pub fn needs_ingest(&self) -> bool {
        !matches!(self, ChangeKind::Unchanged)
    }
}

/// Decide what to do with a file. Idempotent against catalog state, so a
/// partial scan can simply be repeated.
pub fn classify(
    existing: Option<&PhotoRecord>,
    fingerprint: &Fingerprint,
    embeddings_enabled: bool,
) -> ChangeKind {
    let photo = match existing {
        None => return ChangeKind::New,
        Some(p) => p,
    };

    if photo.fingerprint != fingerprint.as_str() {
        return ChangeKind::Changed;
    }

    // A failed thumbnail stays failed until the content changes: the same
    // bytes decode the same way every time
    let thumbnail_failed = photo.thumbnail_state == ThumbnailState::Failed;
    let thumbnail_pending = photo.thumbnail_state == ThumbnailState::Pending;
    let embedding_missing = embeddings_enabled && photo.embedding_state != EmbeddingState::Complete;
    if thumbnail_pending || embedding_missing || (photo.failed && !thumbnail_failed) {
        return ChangeKind::Retry;
    }

    ChangeKind::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::fingerprint::size_mtime;

    fn record(fingerprint: &str) -> PhotoRecord {
        PhotoRecord {
            id: 1,
            root_id: 1,
            rel_path: "a.jpg".to_string(),
            size_bytes: 1,
            mtime_ns: 1,
            fingerprint: fingerprint.to_string(),
            date_taken: None,
            date_source: None,
            width: None,
            height: None,
            thumbnail_state: ThumbnailState::Complete,
            embedding_state: EmbeddingState::Complete,
            embedding_model: Some("m".to_string()),
            failed: false,
            last_failed_error: None,
            indexed_at: None,
        }
    }

    #[test]
    fn test_new_changed_unchanged() {
        let fp = size_mtime(1, 1);
        assert_eq!(classify(None, &fp, true), ChangeKind::New);
        assert_eq!(classify(Some(&record("other")), &fp, true), ChangeKind::Changed);
        assert_eq!(classify(Some(&record(fp.as_str())), &fp, true), ChangeKind::Unchanged);
        assert!(!ChangeKind::Unchanged.needs_ingest());
    }

    #[test]
    fn test_failed_or_incomplete_photos_are_retried() {
        let fp = size_mtime(1, 1);

        let mut failed = record(fp.as_str());
        failed.failed = true;
        assert_eq!(classify(Some(&failed), &fp, true), ChangeKind::Retry);

        let mut no_thumb = record(fp.as_str());
        no_thumb.thumbnail_state = ThumbnailState::Pending;
        assert_eq!(classify(Some(&no_thumb), &fp, false), ChangeKind::Retry);

        let mut pending = record(fp.as_str());
        pending.embedding_state = EmbeddingState::Unavailable;
        assert_eq!(classify(Some(&pending), &fp, true), ChangeKind::Retry);
        // Without an embedder a missing vector is not a reason to re-ingest
        assert_eq!(classify(Some(&pending), &fp, false), ChangeKind::Unchanged);
    }

    #[test]
    fn test_undecodable_image_is_not_retried_until_it_changes() {
        let fp = size_mtime(1, 1);
        let mut corrupt = record(fp.as_str());
        corrupt.thumbnail_state = ThumbnailState::Failed;
        corrupt.failed = true;
        assert_eq!(classify(Some(&corrupt), &fp, true), ChangeKind::Unchanged);
        assert_eq!(classify(Some(&corrupt), &fp, false), ChangeKind::Unchanged);

        // Its embedding still gets another chance
        corrupt.embedding_state = EmbeddingState::Failed;
        assert_eq!(classify(Some(&corrupt), &fp, true), ChangeKind::Retry);

        let edited = size_mtime(2, 2);
        assert_eq!(classify(Some(&corrupt), &edited, true), ChangeKind::Changed);
    }
}
