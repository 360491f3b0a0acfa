//! Approximate nearest-neighbour index over photo embeddings, using USearch.
//!
//! The catalog's `embeddings` table is canonical; this index is a projection
//! of it. Callers write the catalog first and the index second, so any gap
//! left by a crash is an entry missing from the index, which
//! [`reconcile`] repairs on the next start.

pub mod persist;
pub mod reconcile;

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::config::IndexConfig;
use crate::db::{Catalog, PhotoId};
use crate::error::{Error, Result};
use persist::{path_str, IndexFiles, IndexMeta};

pub use reconcile::{reconcile, ReconcileReport};

/// Search hit: photo id and cosine similarity (1 - distance).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub photo_id: PhotoId,
    pub score: f32,
}

/// How the on-disk state was found at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No index on disk.
    Fresh,
    Loaded,
    /// Model or dimensions changed; the old index was discarded.
    Mismatch,
    /// The files were unreadable; the index must be rebuilt from the catalog.
    Corrupt,
}

#[derive(Debug, Clone)]
struct IndexSettings {
    dimensions: usize,
    model_id: String,
    connectivity: usize,
    expansion_add: usize,
    expansion_search: usize,
    initial_capacity: usize,
}

enum PendingOp {
    Upsert(u64, Vec<f32>),
    Remove(u64),
}

struct IndexState {
    index: Index,
    /// Keys that may be returned by a query. Everything else is tombstoned.
    live: HashSet<u64>,
    tombstones: usize,
}

pub struct VectorIndex {
    state: RwLock<IndexState>,
    /// Writes made while a compaction is rebuilding off-lock; replayed at swap time.
    pending: Mutex<Option<Vec<PendingOp>>>,
    settings: IndexSettings,
    files: Option<IndexFiles>,
    dirty: AtomicBool,
    load_outcome: LoadOutcome,
}

fn index_err(e: impl std::fmt::Display) -> Error {
    Error::Index(e.to_string())
}

fn photo_key(photo_id: PhotoId) -> u64 {
    photo_id as u64
}

impl IndexSettings {
    fn new_index(&self, capacity: usize) -> Result<Index> {
        let options = IndexOptions {
            dimensions: self.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.connectivity,
            expansion_add: self.expansion_add,
            expansion_search: self.expansion_search,
            multi: false,
        };

        let index = Index::new(&options).map_err(index_err)?;
        index
            .reserve(capacity.max(self.initial_capacity))
            .map_err(index_err)?;
        Ok(index)
    }
}

impl IndexState {
    fn empty(settings: &IndexSettings) -> Result<Self> {
        Ok(Self {
            index: settings.new_index(settings.initial_capacity)?,
            live: HashSet::new(),
            tombstones: 0,
        })
    }

    fn apply(&mut self, op: &PendingOp, dimensions: usize) -> Result<()> {
        match op {
            PendingOp::Upsert(key, vector) => self.upsert(*key, vector, dimensions),
            PendingOp::Remove(key) => self.remove(*key).map(|_| ()),
        }
    }

    fn upsert(&mut self, key: u64, vector: &[f32], dimensions: usize) -> Result<()> {
        if vector.len() != dimensions {
            return Err(Error::Index(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                dimensions,
                vector.len()
            )));
        }

        if self.index.contains(key) {
            self.index.remove(key).map_err(index_err)?;
            self.tombstones += 1;
        }

        // Removed slots are not reused until compaction
        let needed = self.index.size() + self.tombstones + 1;
        if needed > self.index.capacity() {
            let target = (self.index.capacity() * 2).max(needed);
            self.index.reserve(target).map_err(index_err)?;
        }

        self.index.add(key, vector).map_err(index_err)?;
        self.live.insert(key);
        Ok(())
    }

    fn remove(&mut self, key: u64) -> Result<bool> {
        let was_live = self.live.remove(&key);
        if self.index.contains(key) {
            self.index.remove(key).map_err(index_err)?;
            self.tombstones += 1;
        }
        Ok(was_live)
    }
}

impl VectorIndex {
    /// In-memory index, never persisted.
    pub fn in_memory(dimensions: usize, model_id: &str, config: &IndexConfig) -> Result<Self> {
        let settings = settings_from(dimensions, model_id, config);
        Ok(Self {
            state: RwLock::new(IndexState::empty(&settings)?),
            pending: Mutex::new(None),
            settings,
            files: None,
            dirty: AtomicBool::new(false),
            load_outcome: LoadOutcome::Fresh,
        })
    }

    /// Open the index stored under `config.dir`, or start empty.
    ///
    /// A sidecar that disagrees with `model_id`/`dimensions` discards the old
    /// files. Unreadable files yield an empty index with
    /// [`LoadOutcome::Corrupt`] so the caller can rebuild from the catalog.
    pub fn open(dimensions: usize, model_id: &str, config: &IndexConfig) -> Result<Self> {
        let settings = settings_from(dimensions, model_id, config);
        let files = IndexFiles::new(&config.dir);
        files.ensure_dir()?;

        let expected = IndexMeta::new(dimensions, model_id);
        let (state, outcome) = match files.read_meta() {
            None if !files.has_index() => (IndexState::empty(&settings)?, LoadOutcome::Fresh),
            Some(meta) if meta != expected => {
                info!(
                    stored_model = %meta.model_id,
                    stored_dimensions = meta.dimensions,
                    model = %model_id,
                    dimensions,
                    "Vector index built for a different model, starting fresh"
                );
                files.remove_all();
                (IndexState::empty(&settings)?, LoadOutcome::Mismatch)
            }
            _ => match load_state(&settings, &files) {
                Ok(state) => {
                    info!(entries = state.live.len(), "Loaded vector index");
                    (state, LoadOutcome::Loaded)
                }
                Err(e) => {
                    warn!(error = %e, "Vector index unreadable, will rebuild from catalog");
                    files.remove_all();
                    (IndexState::empty(&settings)?, LoadOutcome::Corrupt)
                }
            },
        };

        Ok(Self {
            state: RwLock::new(state),
            pending: Mutex::new(None),
            settings,
            files: Some(files),
            dirty: AtomicBool::new(false),
            load_outcome: outcome,
        })
    }

    pub fn load_outcome(&self) -> LoadOutcome {
        self.load_outcome
    }

    pub fn model_id(&self) -> &str {
        &self.settings.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    /// Insert or replace the vector for a photo. Never duplicates a photo id.
    pub fn upsert(&self, photo_id: PhotoId, vector: &[f32]) -> Result<()> {
        let key = photo_key(photo_id);
        let mut state = self.state.write();
        state.upsert(key, vector, self.settings.dimensions)?;
        if let Some(log) = self.pending.lock().as_mut() {
            log.push(PendingOp::Upsert(key, vector.to_vec()));
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove a photo. It is excluded from every later query even if the
    /// graph slot is only reclaimed by [`compact`](Self::compact).
    pub fn remove(&self, photo_id: PhotoId) -> Result<bool> {
        let key = photo_key(photo_id);
        let mut state = self.state.write();
        let removed = state.remove(key)?;
        if let Some(log) = self.pending.lock().as_mut() {
            log.push(PendingOp::Remove(key));
        }
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.settings.dimensions {
            return Err(Error::Index(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.settings.dimensions,
                vector.len()
            )));
        }

        let state = self.state.read();
        if state.live.is_empty() {
            return Ok(Vec::new());
        }

        let slack = state.tombstones.min(k);
        let matches = state.index.search(vector, k + slack).map_err(index_err)?;

        let neighbors = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter(|(key, _)| state.live.contains(key))
            .take(k)
            .map(|(&key, &distance)| Neighbor {
                photo_id: key as PhotoId,
                score: 1.0 - distance,
            })
            .collect();
        Ok(neighbors)
    }

    pub fn contains(&self, photo_id: PhotoId) -> bool {
        self.state.read().live.contains(&photo_key(photo_id))
    }

    pub fn len(&self) -> usize {
        self.state.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.state.read().tombstones
    }

    pub fn live_ids(&self) -> Vec<PhotoId> {
        self.state
            .read()
            .live
            .iter()
            .map(|&k| k as PhotoId)
            .collect()
    }

    pub fn needs_compaction(&self, ratio: f32) -> bool {
        let state = self.state.read();
        state.tombstones > 0 && state.tombstones as f32 >= ratio * state.live.len().max(1) as f32
    }

    /// Replace the contents with `vectors`. Entries with the wrong dimension
    /// are skipped and returned so the caller can re-enqueue them.
    pub fn rebuild(&self, vectors: Vec<(PhotoId, Vec<f32>)>) -> Result<Vec<PhotoId>> {
        let (built, skipped) = self.build(vectors)?;
        *self.state.write() = built;
        self.dirty.store(true, Ordering::Release);
        Ok(skipped)
    }

    fn build(&self, vectors: Vec<(PhotoId, Vec<f32>)>) -> Result<(IndexState, Vec<PhotoId>)> {
        let capacity = (vectors.len() * 2).max(self.settings.initial_capacity);
        let mut built = IndexState {
            index: self.settings.new_index(capacity)?,
            live: HashSet::with_capacity(vectors.len()),
            tombstones: 0,
        };

        let mut skipped = Vec::new();
        for (photo_id, vector) in vectors {
            if vector.len() != self.settings.dimensions {
                skipped.push(photo_id);
                continue;
            }
            built.upsert(photo_key(photo_id), &vector, self.settings.dimensions)?;
        }
        Ok((built, skipped))
    }

    /// Rebuild from the catalog's vectors without blocking queries, then swap.
    /// Writes that land during the rebuild are replayed onto the new graph.
    /// Returns the number of tombstones reclaimed.
    pub fn compact(&self, catalog: &Catalog) -> Result<usize> {
        {
            let _state = self.state.write();
            *self.pending.lock() = Some(Vec::new());
        }

        let built = catalog
            .embeddings_for_model(&self.settings.model_id)
            .and_then(|vectors| self.build(vectors));
        let (mut built, _) = match built {
            Ok(b) => b,
            Err(e) => {
                *self.pending.lock() = None;
                return Err(e);
            }
        };

        let mut state = self.state.write();
        let ops = self.pending.lock().take().unwrap_or_default();
        for op in &ops {
            built.apply(op, self.settings.dimensions)?;
        }

        let reclaimed = state.tombstones.saturating_sub(built.tombstones);
        debug!(
            replayed = ops.len(),
            reclaimed,
            entries = built.live.len(),
            "Compacted vector index"
        );
        *state = built;
        self.dirty.store(true, Ordering::Release);
        Ok(reclaimed)
    }

    /// Write the graph and sidecars if anything changed since the last persist.
    pub fn persist(&self) -> Result<bool> {
        let files = match &self.files {
            Some(f) => f,
            None => return Ok(false),
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        if let Err(e) = self.write_files(files) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    fn write_files(&self, files: &IndexFiles) -> Result<()> {
        let state = self.state.read();
        let staging = files.staging_index_path();
        state.index.save(path_str(&staging)?).map_err(index_err)?;
        fs::rename(&staging, files.index_path())?;
        files.write_sidecars(
            &IndexMeta::new(self.settings.dimensions, &self.settings.model_id),
            &state.live,
        )
    }
}

fn settings_from(dimensions: usize, model_id: &str, config: &IndexConfig) -> IndexSettings {
    IndexSettings {
        dimensions,
        model_id: model_id.to_string(),
        connectivity: config.connectivity,
        expansion_add: config.expansion_add,
        expansion_search: config.expansion_search,
        initial_capacity: config.initial_capacity,
    }
}

fn load_state(settings: &IndexSettings, files: &IndexFiles) -> Result<IndexState> {
    let index = settings.new_index(settings.initial_capacity)?;
    index
        .load(path_str(&files.index_path())?)
        .map_err(index_err)?;

    if index.dimensions() != settings.dimensions {
        return Err(Error::Index(format!(
            "Stored graph has {} dimensions, expected {}",
            index.dimensions(),
            settings.dimensions
        )));
    }

    let target = (index.size() * 2).max(settings.initial_capacity);
    index.reserve(target).map_err(index_err)?;

    let live: HashSet<u64> = files
        .read_keys()?
        .into_iter()
        .filter(|k| index.contains(*k))
        .collect();

    Ok(IndexState {
        index,
        live,
        tombstones: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config(dir: &Path) -> IndexConfig {
        IndexConfig {
            dir: dir.to_path_buf(),
            initial_capacity: 16,
            ..IndexConfig::default()
        }
    }

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[i] = 1.0;
        v
    }

    #[test]
    fn test_upsert_query_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::in_memory(4, "m", &test_config(dir.path())).unwrap();

        index.upsert(1, &unit(0)).unwrap();
        index.upsert(2, &unit(1)).unwrap();
        index.upsert(3, &[0.9, 0.1, 0.0, 0.0]).unwrap();

        let hits = index.query(&unit(0), 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].photo_id, 1);
        assert!(hits[0].score > 0.99);

        // Replacing keeps a single entry for the photo
        index.upsert(1, &unit(2)).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.query(&unit(2), 1).unwrap()[0].photo_id, 1);
    }

    #[test]
    fn test_removed_ids_never_returned() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::in_memory(4, "m", &test_config(dir.path())).unwrap();
        for id in 1..=20 {
            index.upsert(id, &[id as f32, 1.0, 0.0, 0.0]).unwrap();
        }

        assert!(index.remove(5).unwrap());
        assert!(!index.remove(5).unwrap());
        assert!(!index.contains(5));

        let hits = index.query(&[5.0, 1.0, 0.0, 0.0], 20).unwrap();
        assert!(hits.iter().all(|h| h.photo_id != 5));
        assert_eq!(hits.len(), 19);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::in_memory(4, "m", &test_config(dir.path())).unwrap();
        assert!(matches!(index.upsert(1, &[1.0, 2.0]), Err(Error::Index(_))));
        assert!(index.query(&[1.0], 3).is_err());
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let index = VectorIndex::open(4, "m", &config).unwrap();
            assert_eq!(index.load_outcome(), LoadOutcome::Fresh);
            index.upsert(1, &unit(0)).unwrap();
            index.upsert(2, &unit(1)).unwrap();
            index.remove(2).unwrap();
            assert!(index.persist().unwrap());
            assert!(!index.persist().unwrap());
        }

        let index = VectorIndex::open(4, "m", &config).unwrap();
        assert_eq!(index.load_outcome(), LoadOutcome::Loaded);
        assert!(index.contains(1));
        assert!(!index.contains(2));
        assert_eq!(index.query(&unit(0), 5).unwrap().len(), 1);
    }

    #[test]
    fn test_model_change_discards_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let index = VectorIndex::open(4, "old", &config).unwrap();
            index.upsert(1, &unit(0)).unwrap();
            index.persist().unwrap();
        }

        let index = VectorIndex::open(4, "new", &config).unwrap();
        assert_eq!(index.load_outcome(), LoadOutcome::Mismatch);
        assert!(index.is_empty());
    }

    #[test]
    fn test_corrupt_file_reports_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let index = VectorIndex::open(4, "m", &config).unwrap();
            index.upsert(1, &unit(0)).unwrap();
            index.persist().unwrap();
        }
        fs::write(dir.path().join(persist::INDEX_FILE), b"garbage").unwrap();

        let index = VectorIndex::open(4, "m", &config).unwrap();
        assert_eq!(index.load_outcome(), LoadOutcome::Corrupt);
        assert!(index.is_empty());
    }

    #[test]
    fn test_compact_reclaims_tombstones() {
        use crate::db::{DateSource, PhotoUpsert};
        use chrono::Utc;

        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.insert_root(dir.path()).unwrap();
        let index = VectorIndex::in_memory(4, "m", &test_config(dir.path())).unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let rel = format!("{}.jpg", i);
            let id = catalog
                .upsert_photo(&PhotoUpsert {
                    root_id: root.id,
                    rel_path: &rel,
                    size_bytes: 1,
                    mtime_ns: 1,
                    fingerprint: "fp",
                    date_taken: Utc::now(),
                    date_source: DateSource::Mtime,
                })
                .unwrap()
                .id;
            catalog.set_embedding_complete(id, &unit(i), "m").unwrap();
            index.upsert(id, &unit(i)).unwrap();
            ids.push(id);
        }

        catalog.delete_photo(ids[0]).unwrap();
        index.remove(ids[0]).unwrap();
        index.upsert(ids[1], &unit(1)).unwrap();
        assert_eq!(index.tombstones(), 2);
        assert!(index.needs_compaction(0.25));

        assert_eq!(index.compact(&catalog).unwrap(), 2);
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 3);
        assert!(!index.contains(ids[0]));
    }
}
