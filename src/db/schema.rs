pub const SCHEMA: &str = r#"
-- Roots: user-tracked top-level directories
CREATE TABLE IF NOT EXISTS roots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'unknown',
    added_at TEXT NOT NULL,
    last_seen_at TEXT,
    last_scan_started_at TEXT,
    last_scan_enumerated_at TEXT,
    last_scan_finished_at TEXT,
    last_error TEXT
);

-- Photos: one row per indexed file, keyed by (root_id, rel_path)
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id INTEGER NOT NULL,
    rel_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,

    date_taken TEXT,
    date_source TEXT,
    width INTEGER,
    height INTEGER,

    thumbnail_state TEXT NOT NULL DEFAULT 'pending',
    embedding_state TEXT NOT NULL DEFAULT 'pending',
    embedding_model TEXT,

    failed INTEGER NOT NULL DEFAULT 0,
    last_failed_error TEXT,
    indexed_at TEXT,

    UNIQUE (root_id, rel_path),
    FOREIGN KEY (root_id) REFERENCES roots(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_photos_root ON photos(root_id);
CREATE INDEX IF NOT EXISTS idx_photos_date_taken ON photos(date_taken);

-- Embeddings: f32 little-endian vectors, the source for index rebuilds
CREATE TABLE IF NOT EXISTS embeddings (
    photo_id INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

-- Scan waves: one enumeration pass over a root
CREATE TABLE IF NOT EXISTS scan_waves (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    found INTEGER NOT NULL DEFAULT 0,
    enqueued INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    finished_at TEXT,
    had_errors INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (root_id) REFERENCES roots(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_scan_waves_root ON scan_waves(root_id);
"#;

/// Applied in order; `PRAGMA user_version` records how many have run.
pub const MIGRATIONS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_photos_embedding_state ON photos(embedding_state)",
    "CREATE INDEX IF NOT EXISTS idx_photos_failed ON photos(failed) WHERE failed = 1",
];
