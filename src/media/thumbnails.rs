use image::ImageFormat;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ThumbnailError, ThumbnailHandle, Thumbnailer};
use crate::config::ThumbnailConfig;
use crate::db::PhotoId;
use crate::scanner::Fingerprint;

const SHARDS: i64 = 1000;

/// Disk cache of JPEG thumbnails keyed by photo id and fingerprint.
pub struct ImageThumbnailer {
    cache_dir: PathBuf,
    size: u32,
}

impl ImageThumbnailer {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
            size: config.size,
        }
    }

    fn shard_dir(&self, photo_id: PhotoId) -> PathBuf {
        self.cache_dir
            .join(format!("{:03}", photo_id.rem_euclid(SHARDS)))
    }

    pub fn cache_path(&self, photo_id: PhotoId, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(photo_id)
            .join(format!("{}.{}.jpg", photo_id, fingerprint))
    }

    /// Remove cached files for `photo_id` other than `keep`.
    fn evict_except(&self, photo_id: PhotoId, keep: Option<&Path>) {
        let prefix = format!("{}.", photo_id);
        let entries = match fs::read_dir(self.shard_dir(photo_id)) {
            Ok(e) => e,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            if keep == Some(path.as_path()) {
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to evict thumbnail");
            }
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl Thumbnailer for ImageThumbnailer {
    fn generate(
        &self,
        photo_id: PhotoId,
        fingerprint: &Fingerprint,
        original: &Path,
    ) -> Result<ThumbnailHandle, ThumbnailError> {
        let cache_path = self.cache_path(photo_id, fingerprint);

        // Reuse the cached file; only the header is read for dimensions
        if cache_path.exists() {
            if let Ok((width, height)) = image::image_dimensions(original) {
                return Ok(ThumbnailHandle {
                    path: cache_path,
                    width,
                    height,
                });
            }
        }

        let img = image::open(original).map_err(|e| match e {
            image::ImageError::IoError(io) => ThumbnailError::Io(io),
            other => ThumbnailError::Decode(other.to_string()),
        })?;
        let (width, height) = (img.width(), img.height());
        let thumbnail = img.thumbnail(self.size, self.size).to_rgb8();

        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write beside the final name, then rename, so readers never see a partial file
        let tmp_path = cache_path.with_extension("jpg.tmp");
        thumbnail
            .save_with_format(&tmp_path, ImageFormat::Jpeg)
            .map_err(|e| match e {
                image::ImageError::IoError(io) => ThumbnailError::Io(io),
                other => ThumbnailError::Decode(other.to_string()),
            })?;
        fs::rename(&tmp_path, &cache_path)?;

        self.evict_except(photo_id, Some(&cache_path));

        Ok(ThumbnailHandle {
            path: cache_path,
            width,
            height,
        })
    }

    fn evict(&self, photo_id: PhotoId) {
        self.evict_except(photo_id, None);
    }
}
