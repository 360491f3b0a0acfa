use std::collections::HashSet;
use tracing::info;

use super::{LoadOutcome, VectorIndex};
use crate::db::{Catalog, PhotoId};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rebuilt from catalog vectors after an unreadable index.
    pub rebuilt: bool,
    /// Complete in the catalog but absent from the index; now pending re-embedding.
    pub reenqueued: usize,
    /// Present in the index without a complete catalog row; removed.
    pub removed: usize,
    /// Completions from another model, demoted to pending.
    pub model_reset: usize,
}

/// Bring a freshly opened index in line with the catalog.
///
/// Photos the index lost are put back to `pending` rather than dropped, so the
/// startup scan of every root re-enqueues them for embedding.
pub fn reconcile(catalog: &Catalog, index: &VectorIndex) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        model_reset: catalog.reset_other_model_embeddings(index.model_id())?,
        ..ReconcileReport::default()
    };

    let mut reenqueue: Vec<PhotoId> = Vec::new();
    if index.load_outcome() == LoadOutcome::Corrupt {
        let vectors = catalog.embeddings_for_model(index.model_id())?;
        reenqueue.extend(index.rebuild(vectors)?);
        report.rebuilt = true;
    }

    let complete: HashSet<PhotoId> = catalog
        .complete_embedding_ids(index.model_id())?
        .into_iter()
        .collect();

    reenqueue.extend(complete.iter().copied().filter(|id| !index.contains(*id)));
    reenqueue.sort_unstable();
    reenqueue.dedup();
    report.reenqueued = catalog.mark_embeddings_pending(&reenqueue)?;

    for id in index.live_ids() {
        if !complete.contains(&id) && index.remove(id)? {
            report.removed += 1;
        }
    }

    if report != ReconcileReport::default() {
        info!(
            rebuilt = report.rebuilt,
            reenqueued = report.reenqueued,
            removed = report.removed,
            model_reset = report.model_reset,
            "Reconciled vector index with catalog"
        );
    }
    Ok(report)
}
