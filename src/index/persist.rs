//! On-disk layout of the vector index: the usearch graph plus two JSON sidecars.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const INDEX_FILE: &str = "photos.usearch";
pub const META_FILE: &str = "meta.json";
pub const KEYS_FILE: &str = "keys.json";

pub const METRIC: &str = "cos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub dimensions: usize,
    pub model_id: String,
    pub metric: String,
}

impl IndexMeta {
    pub fn new(dimensions: usize, model_id: &str) -> Self {
        Self {
            dimensions,
            model_id: model_id.to_string(),
            metric: METRIC.to_string(),
        }
    }
}

pub struct IndexFiles {
    dir: PathBuf,
}

impl IndexFiles {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn has_index(&self) -> bool {
        self.index_path().exists()
    }

    pub fn read_meta(&self) -> Option<IndexMeta> {
        let content = fs::read_to_string(self.dir.join(META_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn read_keys(&self) -> Result<HashSet<u64>> {
        let content = fs::read_to_string(self.dir.join(KEYS_FILE))?;
        let keys: Vec<u64> = serde_json::from_str(&content)?;
        Ok(keys.into_iter().collect())
    }

    pub fn write_sidecars(&self, meta: &IndexMeta, keys: &HashSet<u64>) -> Result<()> {
        let mut sorted: Vec<u64> = keys.iter().copied().collect();
        sorted.sort_unstable();
        write_atomic(&self.dir.join(KEYS_FILE), &serde_json::to_vec(&sorted)?)?;
        write_atomic(&self.dir.join(META_FILE), &serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    /// Temporary path the graph is saved to before being renamed into place.
    pub fn staging_index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.tmp", INDEX_FILE))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn remove_all(&self) {
        for name in [INDEX_FILE, META_FILE, KEYS_FILE] {
            let _ = fs::remove_file(self.dir.join(name));
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Index(format!("Non UTF-8 index path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecars_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = IndexFiles::new(dir.path());
        assert!(files.read_meta().is_none());

        let meta = IndexMeta::new(8, "stub-v1");
        let keys: HashSet<u64> = [3, 1, 2].into_iter().collect();
        files.write_sidecars(&meta, &keys).unwrap();

        assert_eq!(files.read_meta(), Some(meta));
        assert_eq!(files.read_keys().unwrap(), keys);
    }
}
