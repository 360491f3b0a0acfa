use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::{call_blocking, StepError};
use super::{IngestTask, RetryPolicy};
use crate::config::IngestConfig;
use crate::db::{Catalog, DateSource, EmbeddingState, PhotoId, PhotoUpsert, ThumbnailState};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::media::{DateExtractor, EmbedError, Embedder, ThumbnailError, Thumbnailer};
use crate::roots::RootManager;
use crate::scheduler::ScanScheduler;
use crate::shutdown::Shutdown;
use crate::status::{RecentIngest, StatusAggregator};

/// Everything a worker needs, shared by the whole pool.
pub struct IngestContext {
    pub catalog: Arc<Catalog>,
    /// `None` when no embedder is configured.
    pub index: Option<Arc<VectorIndex>>,
    pub roots: Arc<RootManager>,
    pub aggregator: Arc<StatusAggregator>,
    pub scheduler: Arc<ScanScheduler>,
    pub dates: Arc<dyn DateExtractor>,
    pub thumbnailer: Arc<dyn Thumbnailer>,
    pub embedder: Option<Arc<dyn Embedder>>,
    /// Cleared for good once the embedder reports itself unavailable.
    pub embeddings_enabled: Arc<AtomicBool>,
    pub config: IngestConfig,
    pub policy: RetryPolicy,
    pub shutdown: Arc<Shutdown>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Indexed(PhotoId),
    Failed(Option<PhotoId>),
    /// Stale or vanished; nothing recorded for the photo.
    Skipped,
}

/// Spawn one worker per queue partition.
pub fn spawn_workers(
    ctx: Arc<IngestContext>,
    receivers: Vec<mpsc::Receiver<IngestTask>>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(worker, rx)| tokio::spawn(run_worker(worker, ctx.clone(), rx)))
        .collect()
}

async fn run_worker(worker: usize, ctx: Arc<IngestContext>, mut rx: mpsc::Receiver<IngestTask>) {
    let mut shutdown = ctx.shutdown.subscribe();
    debug!(worker, "Ingest worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let task = tokio::select! {
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        process_task(worker, &ctx, task).await;
    }

    debug!(worker, "Ingest worker stopped");
}

/// Run one task to completion and do its bookkeeping. Never returns an
/// error: catalog failures halt the pipeline through `Shutdown`.
pub(crate) async fn process_task(worker: usize, ctx: &IngestContext, task: IngestTask) {
    let abs = task.abs_path();
    let display = abs.display().to_string();
    ctx.aggregator.begin_ingest(
        worker,
        task.root_id,
        &task.root_path.display().to_string(),
        &display,
    );

    let outcome = match ingest(ctx, &task, &abs).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_fatal() => {
            ctx.shutdown.fatal(format!("Catalog write failed for {}: {}", display, e));
            Outcome::Skipped
        }
        Err(e) => {
            ctx.aggregator.record_failure(&display, &e.to_string());
            Outcome::Failed(task.photo_id)
        }
    };

    let recent = match &outcome {
        Outcome::Indexed(id) => Some((Some(*id), true)),
        Outcome::Failed(id) => Some((*id, false)),
        Outcome::Skipped => None,
    }
    .map(|(photo_id, ok)| RecentIngest {
        photo_id,
        root_id: task.root_id,
        path: display.clone(),
        finished_at: Utc::now(),
        ok,
    });

    task.wave.progress.add_processed();
    match task.wave.maybe_finish(&ctx.catalog) {
        Ok(true) => {
            info!(
                root_id = task.root_id,
                wave_id = task.wave.id,
                processed = task.wave.processed(),
                "Scan wave finished"
            );
            ctx.aggregator.wave_closed(task.root_id, task.wave.id);
        }
        Ok(false) => {}
        Err(e) => ctx.shutdown.fatal(format!("Failed to close scan wave: {}", e)),
    }
    ctx.aggregator.end_ingest(worker, recent);
}

fn still_online(task: &IngestTask) -> bool {
    let online = task.online.load(Ordering::SeqCst);
    if !online {
        task.wave.progress.mark_errors();
        debug!(root_id = task.root_id, path = %task.rel_path, "Dropping stale ingest task");
    }
    online
}

async fn ingest(ctx: &IngestContext, task: &IngestTask, abs: &Path) -> Result<Outcome> {
    if !still_online(task) {
        return Ok(Outcome::Skipped);
    }

    if let Err(e) = tokio::fs::metadata(abs).await {
        if e.kind() != ErrorKind::NotFound {
            return fail(ctx, task.photo_id, abs, format!("Cannot read file: {}", e));
        }
        let root_present = tokio::fs::try_exists(task.root_path.as_path())
            .await
            .unwrap_or(false);
        if root_present {
            // Deleted between enumeration and now; the next scan drops the row
            debug!(path = %abs.display(), "File vanished before ingest");
        } else {
            task.wave.progress.mark_errors();
            ctx.roots
                .record_root_error(task.root_id, &format!("Root unavailable: {}", e))?;
            ctx.scheduler.request_health_check(task.root_id);
        }
        return Ok(Outcome::Skipped);
    }

    let mtime = DateTime::<Utc>::from_timestamp_nanos(task.mtime_ns);
    let (date_taken, date_source) = extract_date(ctx, abs, mtime).await;

    let upserted = ctx.catalog.upsert_photo(&PhotoUpsert {
        root_id: task.root_id,
        rel_path: &task.rel_path,
        size_bytes: task.size_bytes as i64,
        mtime_ns: task.mtime_ns,
        fingerprint: task.fingerprint.as_str(),
        date_taken,
        date_source,
    })?;
    let photo_id = upserted.id;

    if upserted.fingerprint_changed {
        if let Some(index) = &ctx.index {
            // The live set is updated before the graph, so a failure here
            // still keeps the old vector out of query results
            if let Err(e) = index.remove(photo_id) {
                warn!(photo_id, error = %e, "Failed to drop outdated vector");
            }
        }
    }

    let photo = match ctx.catalog.get_photo(photo_id)? {
        Some(photo) => photo,
        None => return Ok(Outcome::Skipped),
    };
    if !still_online(task) {
        return Ok(Outcome::Skipped);
    }

    let mut failure: Option<String> = None;
    let mut thumbnail_state = photo.thumbnail_state;

    if thumbnail_state == ThumbnailState::Pending {
        let thumbnailer = ctx.thumbnailer.clone();
        let fingerprint = task.fingerprint.clone();
        let path = abs.to_path_buf();
        let result = call_blocking(
            &ctx.policy,
            ctx.config.thumbnail_timeout(),
            ThumbnailError::is_transient,
            move || thumbnailer.generate(photo_id, &fingerprint, &path),
        )
        .await;

        let (state, dimensions, message) = match result {
            Ok(handle) => (
                ThumbnailState::Complete,
                Some((handle.width, handle.height)),
                None,
            ),
            Err(e) => (ThumbnailState::Failed, None, Some(format!("Thumbnail: {}", e))),
        };
        if !ctx.catalog.set_thumbnail_state(photo_id, state, dimensions)? {
            return Ok(deleted_under_us(ctx, photo_id, abs));
        }
        thumbnail_state = state;
        failure = message;
    }

    if !still_online(task) {
        return Ok(Outcome::Skipped);
    }

    if photo.embedding_state != EmbeddingState::Complete {
        match embed(ctx, photo_id, abs.to_path_buf()).await? {
            Step::Done => {}
            Step::Failed(message) => {
                failure.get_or_insert(message);
            }
            Step::Gone => return Ok(deleted_under_us(ctx, photo_id, abs)),
        }
    }

    match failure {
        Some(message) => fail(ctx, Some(photo_id), abs, message),
        None => {
            // An earlier thumbnail failure stands until the file changes
            if photo.failed && thumbnail_state != ThumbnailState::Failed {
                ctx.catalog.clear_photo_failure(photo_id)?;
            }
            Ok(Outcome::Indexed(photo_id))
        }
    }
}

async fn extract_date(
    ctx: &IngestContext,
    abs: &Path,
    mtime: DateTime<Utc>,
) -> (DateTime<Utc>, DateSource) {
    let dates = ctx.dates.clone();
    let path = abs.to_path_buf();
    tokio::task::spawn_blocking(move || dates.extract_date(&path, mtime))
        .await
        .unwrap_or((mtime, DateSource::Mtime))
}

/// Outcome of the embedding step.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Done,
    Failed(String),
    /// The photo row was deleted while the step ran.
    Gone,
}

/// A scan dropped the row while this task was working on it. The file is
/// gone, so there is nothing to record.
fn deleted_under_us(ctx: &IngestContext, photo_id: PhotoId, abs: &Path) -> Outcome {
    debug!(photo_id, path = %abs.display(), "Photo deleted during ingest");
    ctx.thumbnailer.evict(photo_id);
    Outcome::Skipped
}

async fn embed(ctx: &IngestContext, photo_id: PhotoId, path: PathBuf) -> Result<Step> {
    let embedder = match &ctx.embedder {
        Some(embedder) if ctx.embeddings_enabled.load(Ordering::SeqCst) => embedder.clone(),
        _ => {
            ctx.catalog
                .set_embedding_state(photo_id, EmbeddingState::Unavailable)?;
            return Ok(Step::Done);
        }
    };

    let call = embedder.clone();
    let result = call_blocking(
        &ctx.policy,
        ctx.config.embedding_timeout(),
        EmbedError::is_transient,
        move || call.embed(&path),
    )
    .await;

    let vector = match result {
        Ok(vector) => vector,
        Err(StepError::Failed(EmbedError::Unavailable(reason))) => {
            if ctx.embeddings_enabled.swap(false, Ordering::SeqCst) {
                warn!(reason = %reason, "Embedding model unavailable, content search disabled");
            }
            ctx.catalog
                .set_embedding_state(photo_id, EmbeddingState::Unavailable)?;
            return Ok(Step::Done);
        }
        Err(e) => {
            ctx.catalog
                .set_embedding_state(photo_id, EmbeddingState::Failed)?;
            return Ok(Step::Failed(format!("Embedding: {}", e)));
        }
    };

    if vector.len() != embedder.dimensions() {
        ctx.catalog
            .set_embedding_state(photo_id, EmbeddingState::Failed)?;
        return Ok(Step::Failed(format!(
            "Embedding: expected {} dimensions, got {}",
            embedder.dimensions(),
            vector.len()
        )));
    }

    // Catalog first: a crash before the index write reconciles as "missing"
    if !ctx
        .catalog
        .set_embedding_complete(photo_id, &vector, embedder.model_id())?
    {
        return Ok(Step::Gone);
    }
    if let Some(index) = &ctx.index {
        if let Err(e) = index.upsert(photo_id, &vector) {
            ctx.catalog
                .set_embedding_state(photo_id, EmbeddingState::Failed)?;
            return Ok(Step::Failed(format!("Index insert: {}", e)));
        }
        // A deletion that landed between the two writes already ran its
        // index removal; undo the insert it could not see
        if ctx.catalog.get_photo(photo_id)?.is_none() {
            if let Err(e) = index.remove(photo_id) {
                warn!(photo_id, error = %e, "Failed to drop vector of deleted photo");
            }
            return Ok(Step::Gone);
        }
    }
    Ok(Step::Done)
}

/// Record the one failure a task is allowed to produce.
fn fail(
    ctx: &IngestContext,
    photo_id: Option<PhotoId>,
    abs: &Path,
    message: String,
) -> Result<Outcome> {
    if let Some(id) = photo_id {
        ctx.catalog.mark_photo_failed(id, &message)?;
    }
    debug!(path = %abs.display(), error = %message, "Ingest failed");
    ctx.aggregator
        .record_failure(&abs.display().to_string(), &message);
    Ok(Outcome::Failed(photo_id))
}
