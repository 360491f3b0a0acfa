//! SQLite catalog: the canonical store for roots, photos, embeddings and scan waves.
//!
//! The ANN index is a projection of the `embeddings` table; everything that
//! must survive a crash lives here.

mod schema;
pub mod embeddings;
pub mod photos;
pub mod roots;
pub mod waves;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

pub use embeddings::{bytes_to_embedding, embedding_to_bytes};
pub use photos::{PhotoRecord, PhotoUpsert, UpsertOutcome};
pub use roots::Root;
pub use schema::{MIGRATIONS, SCHEMA};
pub use waves::WaveRecord;

pub type RootId = i64;
pub type PhotoId = i64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a tracked root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootStatus {
    Unknown,
    Online,
    Offline,
    Missing,
}

impl RootStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootStatus::Unknown => "unknown",
            RootStatus::Online => "online",
            RootStatus::Offline => "offline",
            RootStatus::Missing => "missing",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(RootStatus::Unknown),
            "online" => Some(RootStatus::Online),
            "offline" => Some(RootStatus::Offline),
            "missing" => Some(RootStatus::Missing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailState {
    Pending,
    Complete,
    Failed,
}

impl ThumbnailState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailState::Pending => "pending",
            ThumbnailState::Complete => "complete",
            ThumbnailState::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ThumbnailState::Pending),
            "complete" => Some(ThumbnailState::Complete),
            "failed" => Some(ThumbnailState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingState {
    Pending,
    Complete,
    Failed,
    /// No model was loaded when the photo was ingested.
    Unavailable,
}

impl EmbeddingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingState::Pending => "pending",
            EmbeddingState::Complete => "complete",
            EmbeddingState::Failed => "failed",
            EmbeddingState::Unavailable => "unavailable",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EmbeddingState::Pending),
            "complete" => Some(EmbeddingState::Complete),
            "failed" => Some(EmbeddingState::Failed),
            "unavailable" => Some(EmbeddingState::Unavailable),
            _ => None,
        }
    }
}

/// Where a photo's `date_taken` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DateSource {
    Exif,
    Mtime,
}

impl DateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateSource::Exif => "exif",
            DateSource::Mtime => "mtime",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "exif" => Some(DateSource::Exif),
            "mtime" => Some(DateSource::Mtime),
            _ => None,
        }
    }
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        let applied: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        for (i, migration) in MIGRATIONS.iter().enumerate().skip(applied.max(0) as usize) {
            conn.execute_batch(migration)?;
            conn.pragma_update(None, "user_version", (i + 1) as i64)?;
        }
        Ok(())
    }
}

/// Map a text column back to an enum, surfacing unknown values as a conversion error.
fn parse_column<T>(idx: usize, value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value {:?}", value).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");

        {
            let catalog = Catalog::open(&path).unwrap();
            catalog.insert_root(dir.path()).unwrap();
        }

        let catalog = Catalog::open(&path).unwrap();
        assert_eq!(catalog.list_roots().unwrap().len(), 1);
        let version: i64 = catalog
            .conn
            .lock()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            RootStatus::Unknown,
            RootStatus::Online,
            RootStatus::Offline,
            RootStatus::Missing,
        ] {
            assert_eq!(RootStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(EmbeddingState::from_str("unavailable"), Some(EmbeddingState::Unavailable));
        assert_eq!(ThumbnailState::from_str("bogus"), None);
    }
}
