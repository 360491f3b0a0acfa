//! Continuous photo indexing.
//!
//! Tracks user-chosen root directories, scans them into a SQLite catalog,
//! runs a bounded ingest pipeline (date, thumbnail, embedding) and keeps an
//! approximate nearest-neighbour index in step with the catalog. A status
//! aggregator publishes coalesced snapshots of all of it.

pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod roots;
pub mod scanner;
pub mod scheduler;
pub mod shutdown;
pub mod status;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Collaborators, Indexer, SearchHit};
pub use status::{StatusSnapshot, StatusStream};
