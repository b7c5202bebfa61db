use std::{collections::HashSet, io::ErrorKind, path::PathBuf, time::SystemTime};

use async_trait::async_trait;
use photoframe_types::{raster::RasterBuffer, PhotoframeError, Result};
use tokio::fs;
use tracing::{debug, warn};

use crate::CacheKey;

const RASTER_SUFFIX: &str = ".rgb565";

/// Backing store that lets converted rasters outlive the process.
#[async_trait]
pub trait RasterStore: Send + Sync {
    /// Stored raster for `key`, if it was written no earlier than `not_before`.
    async fn load(&self, key: &CacheKey, not_before: SystemTime) -> Result<Option<RasterBuffer>>;
    async fn save(&self, key: &CacheKey, raster: &RasterBuffer) -> Result<()>;
    async fn clear_bucket(&self, bucket: &str) -> Result<()>;
    /// Remove rasters of `bucket` whose source is not in `present`; returns how many went.
    async fn retain(&self, bucket: &str, present: &HashSet<String>) -> Result<usize>;
}

/// One raw RGB565 file per key under `<root>/<bucket>/<source>.<w>x<h>.rgb565`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.bucket).join(key.file_name())
    }
}

fn cache_error(action: &str, path: &std::path::Path, err: std::io::Error) -> PhotoframeError {
    PhotoframeError::CacheIo(format!("failed to {action} {}: {err}", path.display()))
}

#[async_trait]
impl RasterStore for DiskStore {
    async fn load(&self, key: &CacheKey, not_before: SystemTime) -> Result<Option<RasterBuffer>> {
        let path = self.path_for(key);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(cache_error("stat", &path, err)),
        };
        let written = metadata
            .modified()
            .map_err(|err| cache_error("stat", &path, err))?;
        if written < not_before {
            debug!("Persisted raster {:?} predates its source", path);
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|err| cache_error("read", &path, err))?;
        match RasterBuffer::new(key.width, key.height, bytes) {
            Ok(buffer) => Ok(Some(buffer)),
            Err(err) => {
                warn!("Discarding truncated raster {:?}: {err}", path);
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &CacheKey, raster: &RasterBuffer) -> Result<()> {
        let path = self.path_for(key);
        let dir = self.root.join(&key.bucket);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| cache_error("create", &dir, err))?;
        // Write aside and rename so a crash never leaves a short file under the real name.
        let staging = path.with_extension("rgb565.part");
        fs::write(&staging, raster.as_bytes())
            .await
            .map_err(|err| cache_error("write", &staging, err))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|err| cache_error("rename", &path, err))
    }

    async fn clear_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.root.join(bucket);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(cache_error("remove", &dir, err)),
        }
    }

    async fn retain(&self, bucket: &str, present: &HashSet<String>) -> Result<usize> {
        let dir = self.root.join(bucket);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(cache_error("list", &dir, err)),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| cache_error("list", &dir, err))?
        {
            let file_name = entry.file_name();
            let Some(source) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(RASTER_SUFFIX))
                .and_then(|stem| stem.rsplit_once('.'))
                .map(|(source, _size)| source)
            else {
                continue;
            };
            if present.contains(source) {
                continue;
            }
            let path = entry.path();
            fs::remove_file(&path)
                .await
                .map_err(|err| cache_error("remove", &path, err))?;
            removed += 1;
        }
        Ok(removed)
    }
}
