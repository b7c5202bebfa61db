use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::SystemTime,
};

use chrono::Utc;
use photoframe_codec::is_supported;
use photoframe_types::{raster::SourceImage, PhotoframeError, Result};
use rand::Rng;
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct BucketState {
    dir: PathBuf,
    images: Vec<SourceImage>,
    /// File name to the modification time it failed to decode at.
    rejected: HashMap<String, SystemTime>,
}

impl BucketState {
    fn is_selectable(&self, image: &SourceImage) -> bool {
        self.rejected
            .get(&image.name)
            .map_or(true, |failed_at| *failed_at != image.modified)
    }
}

/// How a bucket's file set moved during a rescan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketChange {
    pub bucket: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub present: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
    pub name: String,
    pub dir: PathBuf,
    pub images: Vec<String>,
    pub selectable: usize,
    pub rejected: Vec<String>,
}

/// Image sets per bucket, refreshed by periodic directory listing.
///
/// Selection only sees the last scan, so bucket content is eventually
/// consistent within one rescan interval.
pub struct PhotoLibrary {
    buckets: RwLock<BTreeMap<String, BucketState>>,
}

impl PhotoLibrary {
    pub fn new(dirs: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        let buckets = dirs
            .into_iter()
            .map(|(name, dir)| {
                (
                    name,
                    BucketState {
                        dir,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            buckets: RwLock::new(buckets),
        }
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.read()
            .map(|buckets| buckets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-list every bucket directory and report the buckets whose file set changed.
    pub async fn rescan(&self) -> Result<Vec<BucketChange>> {
        let dirs: Vec<(String, PathBuf)> = self
            .read()?
            .iter()
            .map(|(name, state)| (name.clone(), state.dir.clone()))
            .collect();

        let mut listings = Vec::with_capacity(dirs.len());
        for (name, dir) in dirs {
            match list_images(&dir).await {
                Ok(images) => listings.push((name, images)),
                // Keep the last good listing; an unreadable directory is not an empty one.
                Err(err) => warn!("Cannot list bucket {} at {:?}: {err}", name, dir),
            }
        }

        let mut changes = Vec::new();
        let mut buckets = self.write()?;
        for (name, images) in listings {
            let Some(state) = buckets.get_mut(&name) else {
                continue;
            };
            let before: HashSet<String> = state.images.iter().map(|i| i.name.clone()).collect();
            let present: HashSet<String> = images.iter().map(|i| i.name.clone()).collect();

            // Forget rejections for files that vanished or were rewritten.
            state.rejected.retain(|file, failed_at| {
                images
                    .iter()
                    .any(|image| &image.name == file && image.modified == *failed_at)
            });
            state.images = images;

            if before != present {
                let mut added: Vec<String> = present.difference(&before).cloned().collect();
                let mut removed: Vec<String> = before.difference(&present).cloned().collect();
                added.sort();
                removed.sort();
                changes.push(BucketChange {
                    bucket: name,
                    added,
                    removed,
                    present,
                });
            }
        }
        Ok(changes)
    }

    /// Every listed image of `bucket`, selectable or not.
    pub fn image_names(&self, bucket: &str) -> Result<Vec<String>> {
        let buckets = self.read()?;
        let state = buckets
            .get(bucket)
            .ok_or_else(|| PhotoframeError::UnknownBucket {
                bucket: bucket.to_string(),
            })?;
        Ok(state.images.iter().map(|image| image.name.clone()).collect())
    }

    /// Images of `bucket` that may be handed out, in name order.
    pub fn selectable(&self, bucket: &str) -> Result<Vec<SourceImage>> {
        let buckets = self.read()?;
        let state = buckets
            .get(bucket)
            .ok_or_else(|| PhotoframeError::NoContent {
                bucket: bucket.to_string(),
            })?;
        Ok(state
            .images
            .iter()
            .filter(|image| state.is_selectable(image))
            .cloned()
            .collect())
    }

    /// Uniformly random selectable image of `bucket`.
    pub fn pick<R: Rng + ?Sized>(&self, bucket: &str, rng: &mut R) -> Result<SourceImage> {
        let mut candidates = self.selectable(bucket)?;
        if candidates.is_empty() {
            return Err(PhotoframeError::NoContent {
                bucket: bucket.to_string(),
            });
        }
        let index = rng.gen_range(0..candidates.len());
        Ok(candidates.swap_remove(index))
    }

    /// Exclude `image` until its file changes.
    pub fn reject(&self, bucket: &str, image: &SourceImage) -> Result<()> {
        let mut buckets = self.write()?;
        if let Some(state) = buckets.get_mut(bucket) {
            state.rejected.insert(image.name.clone(), image.modified);
            info!("Excluding {}/{} from selection", bucket, image.name);
        }
        Ok(())
    }

    /// Store an uploaded photo under a fresh timestamped name and return that name.
    ///
    /// The file becomes selectable with the next rescan.
    pub async fn save_image(&self, bucket: &str, extension: &str, bytes: &[u8]) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &id[..8],
            extension.to_ascii_lowercase()
        );
        if !is_valid_image_name(&name) {
            return Err(PhotoframeError::InvalidImageName { name });
        }
        let dir = self.dir(bucket)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| library_error("create", &dir, err))?;
        // Hidden staging name so a half-written upload is never listed.
        let staging = dir.join(format!(".{name}.part"));
        fs::write(&staging, bytes)
            .await
            .map_err(|err| library_error("write", &staging, err))?;
        let path = dir.join(&name);
        fs::rename(&staging, &path)
            .await
            .map_err(|err| library_error("rename", &path, err))?;
        info!("Stored upload {}/{} ({} bytes)", bucket, name, bytes.len());
        Ok(name)
    }

    /// Delete a photo from a bucket directory.
    pub async fn remove_image(&self, bucket: &str, name: &str) -> Result<()> {
        let path = self.image_path(bucket, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted {}/{}", bucket, name);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(not_found(bucket, name)),
            Err(err) => Err(library_error("remove", &path, err)),
        }
    }

    /// Original file contents of a photo.
    pub async fn read_image(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.image_path(bucket, name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(not_found(bucket, name)),
            Err(err) => Err(library_error("read", &path, err)),
        }
    }

    pub fn snapshot(&self) -> Vec<BucketSummary> {
        let Ok(buckets) = self.read() else {
            return Vec::new();
        };
        buckets
            .iter()
            .map(|(name, state)| {
                let mut rejected: Vec<String> = state.rejected.keys().cloned().collect();
                rejected.sort();
                BucketSummary {
                    name: name.clone(),
                    dir: state.dir.clone(),
                    images: state.images.iter().map(|i| i.name.clone()).collect(),
                    selectable: state
                        .images
                        .iter()
                        .filter(|image| state.is_selectable(image))
                        .count(),
                    rejected,
                }
            })
            .collect()
    }

    fn dir(&self, bucket: &str) -> Result<PathBuf> {
        self.read()?
            .get(bucket)
            .map(|state| state.dir.clone())
            .ok_or_else(|| PhotoframeError::UnknownBucket {
                bucket: bucket.to_string(),
            })
    }

    fn image_path(&self, bucket: &str, name: &str) -> Result<PathBuf> {
        if !is_valid_image_name(name) {
            return Err(PhotoframeError::InvalidImageName {
                name: name.to_string(),
            });
        }
        Ok(self.dir(bucket)?.join(name))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, BucketState>>> {
        self.buckets
            .read()
            .map_err(|_| PhotoframeError::Ops("failed to lock photo library".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, BucketState>>> {
        self.buckets
            .write()
            .map_err(|_| PhotoframeError::Ops("failed to lock photo library".into()))
    }
}

/// A plain file name inside a bucket directory with a supported extension.
pub fn is_valid_image_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && is_supported(Path::new(name))
}

fn not_found(bucket: &str, name: &str) -> PhotoframeError {
    PhotoframeError::ImageNotFound {
        bucket: bucket.to_string(),
        name: name.to_string(),
    }
}

fn library_error(action: &str, path: &Path, err: std::io::Error) -> PhotoframeError {
    PhotoframeError::LibraryIo(format!("failed to {action} {}: {err}", path.display()))
}

/// Supported image files directly inside `dir`, sorted by name.
pub async fn list_images(dir: &Path) -> std::io::Result<Vec<SourceImage>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_supported(&path) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        images.push(SourceImage {
            modified,
            path,
            name,
        });
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}
