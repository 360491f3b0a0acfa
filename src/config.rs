use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub roots: RootsConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,

    /// Used when no embedder is configured; otherwise the embedder decides.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_connectivity")]
    pub connectivity: usize,

    #[serde(default = "default_expansion_add")]
    pub expansion_add: usize,

    #[serde(default = "default_expansion_search")]
    pub expansion_search: usize,

    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,

    /// Compact once removed entries exceed this share of the live entries.
    #[serde(default = "default_compaction_tombstone_ratio")]
    pub compaction_tombstone_ratio: f32,
}

fn default_index_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoindex")
        .join("index")
}

fn default_dimensions() -> usize {
    512
}

fn default_connectivity() -> usize {
    16
}

fn default_expansion_add() -> usize {
    200
}

fn default_expansion_search() -> usize {
    64
}

fn default_initial_capacity() -> usize {
    10_000
}

fn default_persist_interval_secs() -> u64 {
    5
}

fn default_compaction_tombstone_ratio() -> f32 {
    0.25
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            dimensions: default_dimensions(),
            connectivity: default_connectivity(),
            expansion_add: default_expansion_add(),
            expansion_search: default_expansion_search(),
            initial_capacity: default_initial_capacity(),
            persist_interval_secs: default_persist_interval_secs(),
            compaction_tombstone_ratio: default_compaction_tombstone_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_cache_size")]
    pub size: u32,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("photoindex/thumbnails")
}

fn default_thumb_cache_size() -> u32 {
    384
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_cache_path(),
            size: default_thumb_cache_size(),
        }
    }
}

/// How the scanner decides whether a file changed since it was cataloged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintPolicy {
    /// File size plus modification time in nanoseconds. Cheap; relies on mtime resolution.
    #[default]
    SizeMtime,
    /// SHA-256 of the file contents. Reads every byte on every scan.
    ContentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default)]
    pub fingerprint: FingerprintPolicy,

    #[serde(default = "default_skip_hidden")]
    pub skip_hidden: bool,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
    ]
}

fn default_skip_hidden() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            fingerprint: FingerprintPolicy::default(),
            skip_hidden: default_skip_hidden(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Total capacity across all worker partitions.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_thumbnail_timeout_secs")]
    pub thumbnail_timeout_secs: u64,

    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    3000
}

fn default_thumbnail_timeout_secs() -> u64 {
    30
}

fn default_embedding_timeout_secs() -> u64 {
    60
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            thumbnail_timeout_secs: default_thumbnail_timeout_secs(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn thumbnail_timeout(&self) -> Duration {
        Duration::from_secs(self.thumbnail_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootsConfig {
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Periodic fallback rescan for online roots, covering missed watch events.
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,

    /// Missing roots are only probed on every Nth health tick.
    #[serde(default = "default_missing_check_every")]
    pub missing_check_every: u32,

    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_rescan_interval_secs() -> u64 {
    900
}

fn default_missing_check_every() -> u32 {
    10
}

fn default_probe_attempts() -> u32 {
    3
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            rescan_interval_secs: default_rescan_interval_secs(),
            missing_check_every: default_missing_check_every(),
            probe_attempts: default_probe_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_watcher_enabled")]
    pub enabled: bool,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_watcher_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    2_000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_watcher_enabled(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Window over which rapid state changes collapse into one published snapshot.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_coalesce_ms() -> u64 {
    250
}

fn default_heartbeat_secs() -> u64 {
    5
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            coalesce_ms: default_coalesce_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoindex")
        .join("photoindex.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            index: IndexConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            scanner: ScannerConfig::default(),
            ingest: IngestConfig::default(),
            roots: RootsConfig::default(),
            watcher: WatcherConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config.validate())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Clamp sizes that would otherwise deadlock the pipeline.
    pub fn validate(mut self) -> Self {
        self.ingest.workers = self.ingest.workers.max(1);
        self.ingest.queue_capacity = self.ingest.queue_capacity.max(self.ingest.workers);
        self.ingest.retry.max_attempts = self.ingest.retry.max_attempts.max(1);
        self.roots.missing_check_every = self.roots.missing_check_every.max(1);
        self.roots.probe_attempts = self.roots.probe_attempts.max(1);
        self.index.initial_capacity = self.index.initial_capacity.max(16);
        self
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOINDEX_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photoindex")
    }

    /// A config rooted entirely inside `base`, used by tests and `--data-dir`.
    pub fn with_data_dir(base: &Path) -> Self {
        let mut config = Config::default();
        config.db_path = base.join("photoindex.db");
        config.index.dir = base.join("index");
        config.thumbnails.path = base.join("thumbnails");
        config
    }
}
