use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, Metadata};
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::config::FingerprintPolicy;

/// Cheap proxy for "this file's content is the same as last time".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_stored(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Modification time in nanoseconds since the epoch; zero if the platform cannot say.
pub fn mtime_ns(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

pub fn compute(path: &Path, metadata: &Metadata, policy: FingerprintPolicy) -> std::io::Result<Fingerprint> {
    match policy {
        FingerprintPolicy::SizeMtime => Ok(size_mtime(metadata.len(), mtime_ns(metadata))),
        FingerprintPolicy::ContentHash => content_hash(path),
    }
}

pub fn size_mtime(size: u64, mtime_ns: i64) -> Fingerprint {
    Fingerprint(format!("s{}-m{}", size, mtime_ns))
}

pub fn content_hash(path: &Path) -> std::io::Result<Fingerprint> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Fingerprint(format!("h{:x}", hasher.finalize())))
}
