use std::path::PathBuf;

use thiserror::Error;

use crate::db::RootId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Root already tracked: {0}")]
    DuplicateRoot(PathBuf),

    #[error("Invalid root path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Unknown root id {0}")]
    UnknownRoot(RootId),

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Indexer is stopped")]
    Stopped,

    #[error("Fatal pipeline error: {0}")]
    Fatal(String),
}

impl Error {
    /// Store-level failures halt the pipeline; everything else is local to a task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Catalog(_) | Error::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
