//! Memoised RGB565 rasters keyed by bucket, source file and output size.

mod store;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use photoframe_codec::RasterEncoder;
use photoframe_types::{
    raster::{RasterBuffer, RasterSpec, SourceImage},
    PhotoframeError, Result,
};
use tracing::{debug, info, warn};

pub use store::{DiskStore, RasterStore};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub bucket: String,
    pub source: String,
    pub width: u32,
    pub height: u32,
}

impl CacheKey {
    /// Deterministic file name so rasters survive restarts.
    pub fn file_name(&self) -> String {
        format!("{}.{}x{}.rgb565", self.source, self.width, self.height)
    }
}

/// A raster together with the time it is known to be current for.
#[derive(Debug, Clone)]
pub struct CachedRaster {
    pub buffer: Arc<RasterBuffer>,
    pub stamp: SystemTime,
}

type Slot = Arc<tokio::sync::Mutex<Option<CachedRaster>>>;

pub struct RasterCache {
    spec: RasterSpec,
    encoder: Arc<dyn RasterEncoder>,
    store: Arc<dyn RasterStore>,
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl RasterCache {
    pub fn new(
        spec: RasterSpec,
        encoder: Arc<dyn RasterEncoder>,
        store: Arc<dyn RasterStore>,
    ) -> Self {
        Self {
            spec,
            encoder,
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn spec(&self) -> RasterSpec {
        self.spec
    }

    pub fn key(&self, bucket: &str, source: &str) -> CacheKey {
        CacheKey {
            bucket: bucket.to_string(),
            source: source.to_string(),
            width: self.spec.width,
            height: self.spec.height,
        }
    }

    /// Raster for `source`, recomputed only when the file is newer than the cached copy.
    ///
    /// Callers asking for the same key queue on that key's slot, so one encode
    /// serves all of them. Different keys never wait on each other.
    pub async fn get(&self, bucket: &str, source: &SourceImage) -> Result<Arc<RasterBuffer>> {
        let key = self.key(bucket, &source.name);
        let slot = self.slot(&key)?;
        let mut entry = slot.lock().await;

        let modified = source_modified(source).await?;
        if let Some(cached) = entry.as_ref() {
            if cached.stamp >= modified {
                return Ok(cached.buffer.clone());
            }
            debug!("Cached raster for {}/{} is stale", bucket, source.name);
        }

        match self.store.load(&key, modified).await {
            Ok(Some(buffer)) => {
                let buffer = Arc::new(buffer);
                *entry = Some(CachedRaster {
                    buffer: buffer.clone(),
                    stamp: modified,
                });
                debug!("Loaded persisted raster for {}/{}", bucket, source.name);
                return Ok(buffer);
            }
            Ok(None) => {}
            Err(err) => warn!("Ignoring persisted raster for {}/{}: {err}", bucket, source.name),
        }

        let buffer = Arc::new(self.encode(source).await?);
        if let Err(err) = self.store.save(&key, &buffer).await {
            warn!(
                "Serving {}/{} without persisting it: {err}",
                bucket, source.name
            );
        }
        *entry = Some(CachedRaster {
            buffer: buffer.clone(),
            stamp: modified,
        });
        info!("Converted {}/{} to RGB565", bucket, source.name);
        Ok(buffer)
    }

    /// Drop every raster of `bucket`, in memory and on disk.
    pub async fn invalidate(&self, bucket: &str) -> Result<()> {
        self.lock_slots()?.retain(|key, _| key.bucket != bucket);
        self.store.clear_bucket(bucket).await
    }

    /// Drop rasters of `bucket` whose source file is no longer in `present`.
    pub async fn retain(&self, bucket: &str, present: &HashSet<String>) -> Result<usize> {
        let mut dropped = 0;
        self.lock_slots()?.retain(|key, _| {
            let keep = key.bucket != bucket || present.contains(&key.source);
            if !keep {
                dropped += 1;
            }
            keep
        });
        let removed_on_disk = self.store.retain(bucket, present).await?;
        Ok(dropped.max(removed_on_disk))
    }

    /// Number of keys with a slot in memory.
    pub fn len(&self) -> usize {
        self.lock_slots().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &CacheKey) -> Result<Slot> {
        let mut slots = self.lock_slots()?;
        Ok(slots.entry(key.clone()).or_default().clone())
    }

    fn lock_slots(&self) -> Result<std::sync::MutexGuard<'_, HashMap<CacheKey, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| PhotoframeError::CacheIo("failed to lock raster cache".into()))
    }

    async fn encode(&self, source: &SourceImage) -> Result<RasterBuffer> {
        let encoder = self.encoder.clone();
        let path = source.path.clone();
        let spec = self.spec;
        tokio::task::spawn_blocking(move || encoder.encode(&path, &spec))
            .await
            .map_err(|err| PhotoframeError::CacheIo(format!("encoder task failed: {err}")))?
    }
}

async fn source_modified(source: &SourceImage) -> Result<SystemTime> {
    let decode_error = |reason: String| PhotoframeError::Decode {
        path: source.path.clone(),
        reason,
    };
    tokio::fs::metadata(&source.path)
        .await
        .map_err(|err| decode_error(err.to_string()))?
        .modified()
        .map_err(|err| decode_error(err.to_string()))
}
