use std::{
    net::IpAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use photoframe_cache::{DiskStore, RasterCache};
use photoframe_codec::ImageCodec;
use photoframe_registry::{DeviceRecord, DeviceRegistry, Registration};
use photoframe_session::{PinnedImage, SessionStore, SessionSummary};
use photoframe_types::{
    config::PhotoframeConfig,
    device::{ClientKey, MacAddress},
    raster::RasterSpec,
    PhotoframeError, Result,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::library::{BucketSummary, PhotoLibrary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub addresses: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub started_at: DateTime<Utc>,
    pub raster: RasterSpec,
    pub total_chunks: usize,
    pub chunk_size: usize,
    pub default_bucket: String,
    pub buckets: Vec<BucketSummary>,
    pub sessions: Vec<SessionSummary>,
    pub devices: Vec<DeviceRecord>,
    pub bound_addresses: usize,
    pub cached_rasters: usize,
}

/// Where an uploaded photo landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredImage {
    pub bucket: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketListing {
    pub bucket: String,
    pub images: Vec<String>,
}

/// Owns all mutable protocol state; request handlers share it behind an `Arc`.
pub struct PhotoService {
    spec: RasterSpec,
    registry: DeviceRegistry,
    sessions: SessionStore,
    library: PhotoLibrary,
    cache: RasterCache,
    rng: Mutex<StdRng>,
    idle_timeout: Duration,
    started_at: DateTime<Utc>,
}

impl PhotoService {
    pub fn new(
        registry: DeviceRegistry,
        library: PhotoLibrary,
        cache: RasterCache,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            spec: cache.spec(),
            registry,
            sessions: SessionStore::new(),
            library,
            cache,
            rng: Mutex::new(StdRng::from_entropy()),
            idle_timeout,
            started_at: Utc::now(),
        }
    }

    /// Replace the selection RNG, e.g. with a seeded one.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Wire up the codec, disk cache, roster and bucket library from configuration.
    ///
    /// Buckets start empty; call [`rescan`](Self::rescan) before serving.
    pub fn from_config(config: &PhotoframeConfig) -> Result<Self> {
        let registry = DeviceRegistry::from_config(&config.library, &config.devices)?;
        let library = PhotoLibrary::new(
            config
                .library
                .buckets
                .iter()
                .map(|(name, dir)| (name.clone(), PathBuf::from(dir))),
        );
        let cache = RasterCache::new(
            config.raster,
            Arc::new(ImageCodec::new()),
            Arc::new(DiskStore::new(&config.library.cache_dir)),
        );
        Ok(Self::new(
            registry,
            library,
            cache,
            config.sessions.idle_timeout(),
        ))
    }

    pub fn spec(&self) -> RasterSpec {
        self.spec
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn library(&self) -> &PhotoLibrary {
        &self.library
    }

    /// Serve chunk `index` of `key`'s current transfer.
    ///
    /// Chunk 0 resolves the client's bucket, picks a random image and pins its
    /// raster as a new generation; any other chunk reads the pinned raster.
    pub async fn get_chunk(&self, key: &ClientKey, index: i64) -> Result<Vec<u8>> {
        self.spec.chunk_range(index)?;
        if index != 0 {
            return self.sessions.chunk(key, &self.spec, index);
        }

        let bucket = self.registry.resolve(key)?;
        let (ticket, image) = self.sessions.begin(*key, || {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| PhotoframeError::Ops("failed to lock selection rng".into()))?;
            self.library.pick(&bucket, &mut *rng)
        })?;
        info!(
            "[{}] -> {} : {} (generation {})",
            key, bucket, image.name, ticket.generation
        );

        let buffer = match self.cache.get(&bucket, &image).await {
            Ok(buffer) => buffer,
            Err(err) => {
                if err.is_image_rejection() {
                    warn!("Skipping {}/{}: {err}", bucket, image.name);
                    self.library.reject(&bucket, &image)?;
                }
                return Err(err);
            }
        };
        let first = buffer.chunk(&self.spec, 0)?.to_vec();
        let pinned = PinnedImage {
            buffer,
            bucket,
            image: image.name,
        };
        if !self.sessions.install(&ticket, pinned)? {
            // The pinned raster belongs to a newer chunk 0; this one must not be mixed in.
            debug!("[{}] newer chunk 0 arrived while converting", key);
            return Err(PhotoframeError::Sequence);
        }
        Ok(first)
    }

    /// Bind `address` to the device that announced itself from it.
    pub fn register_address(&self, address: IpAddr, mac: MacAddress) -> Result<Registration> {
        let registration = self.registry.bind_address(address, mac)?;
        let name = registration.name.as_deref().unwrap_or("Unknown device");
        if registration.known {
            info!(
                "Registered {} -> {} (MAC: {}, {})",
                address, registration.bucket, mac, name
            );
        } else {
            warn!(
                "Unknown MAC from {}: {} (serving default bucket {})",
                address, mac, registration.bucket
            );
        }
        Ok(registration)
    }

    /// Re-list bucket directories; drops cached rasters of files that disappeared.
    pub async fn rescan(&self) -> Result<usize> {
        let changes = self.library.rescan().await?;
        for change in &changes {
            info!(
                "Bucket {} changed: +{:?} -{:?}",
                change.bucket, change.added, change.removed
            );
            match self.cache.retain(&change.bucket, &change.present).await {
                Ok(0) => {}
                Ok(dropped) => debug!("Dropped {} stale rasters from {}", dropped, change.bucket),
                Err(err) => warn!("Failed to prune cache for {}: {err}", change.bucket),
            }
        }
        Ok(changes.len())
    }

    /// Save an uploaded photo into `bucket` (the default bucket when `None`) and rescan.
    pub async fn upload(
        &self,
        bucket: Option<&str>,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredImage> {
        let bucket = self.bucket_or_default(bucket);
        let name = self.library.save_image(&bucket, extension, bytes).await?;
        self.rescan().await?;
        Ok(StoredImage { bucket, name })
    }

    /// Delete a photo and rescan; sessions already showing it keep their raster.
    pub async fn delete_image(&self, bucket: Option<&str>, name: &str) -> Result<()> {
        let bucket = self.bucket_or_default(bucket);
        self.library.remove_image(&bucket, name).await?;
        self.rescan().await?;
        Ok(())
    }

    pub async fn image_bytes(&self, bucket: Option<&str>, name: &str) -> Result<Vec<u8>> {
        self.library
            .read_image(&self.bucket_or_default(bucket), name)
            .await
    }

    pub fn list_images(&self, bucket: Option<&str>) -> Result<BucketListing> {
        let bucket = self.bucket_or_default(bucket);
        let images = self.library.image_names(&bucket)?;
        Ok(BucketListing { bucket, images })
    }

    fn bucket_or_default(&self, bucket: Option<&str>) -> String {
        bucket
            .unwrap_or_else(|| self.registry.default_bucket())
            .to_string()
    }

    /// Evict idle sessions as of `now`, and the address bindings that went with them.
    pub fn sweep(&self, now: Instant) -> Result<SweepReport> {
        let expired = self.sessions.evict_idle(now, self.idle_timeout)?;
        let addresses: Vec<IpAddr> = expired
            .iter()
            .filter_map(|key| match key {
                ClientKey::Address(ip) => Some(*ip),
                ClientKey::Device(_) => None,
            })
            .collect();
        let mut unbound = self.registry.unbind_addresses(&addresses)?;
        let active = self.sessions.active_addresses();
        unbound += self
            .registry
            .sweep_orphans(now, self.idle_timeout, &active)?
            .len();
        for key in &expired {
            debug!("Session for {} expired", key);
        }
        Ok(SweepReport {
            sessions: expired.len(),
            addresses: unbound,
        })
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            started_at: self.started_at,
            raster: self.spec,
            total_chunks: self.spec.total_chunks(),
            chunk_size: self.spec.chunk_size(),
            default_bucket: self.registry.default_bucket().to_string(),
            buckets: self.library.snapshot(),
            sessions: self.sessions.snapshot(),
            devices: self.registry.snapshot(),
            bound_addresses: self.registry.address_count(),
            cached_rasters: self.cache.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempTree;
    use photoframe_codec::{rgb565_to_rgb, RasterEncoder};
    use photoframe_types::raster::RasterBuffer;
    use std::{collections::HashSet, path::Path};

    const SMALL: RasterSpec = RasterSpec::new(16, 16, 16);

    const RED: [u8; 3] = [255, 0, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    fn service(tree: &TempTree, spec: RasterSpec, buckets: &[&str]) -> PhotoService {
        let dirs: Vec<(String, PathBuf)> = buckets
            .iter()
            .map(|name| (name.to_string(), tree.bucket(name)))
            .collect();
        let registry = DeviceRegistry::new(buckets[0], buckets.iter().map(|b| b.to_string()));
        let library = PhotoLibrary::new(dirs);
        let cache = RasterCache::new(
            spec,
            Arc::new(ImageCodec::new()),
            Arc::new(DiskStore::new(tree.cache_dir())),
        );
        PhotoService::new(registry, library, cache, Duration::from_secs(600))
            .with_rng(StdRng::seed_from_u64(7))
    }

    fn address(last: u8) -> ClientKey {
        ClientKey::Address(IpAddr::from([192, 168, 1, last]))
    }

    fn first_pixel(chunk: &[u8]) -> [u8; 3] {
        rgb565_to_rgb(u16::from_be_bytes([chunk[0], chunk[1]]))
    }

    async fn pull(service: &PhotoService, key: &ClientKey) -> Vec<u8> {
        let mut frame = Vec::new();
        for n in 0..service.spec().total_chunks() as i64 {
            let chunk = service.get_chunk(key, n).await.expect("chunk");
            assert_eq!(chunk.len(), service.spec().chunk_size());
            frame.extend(chunk);
        }
        frame
    }

    #[tokio::test]
    async fn full_pull_of_a_red_square() {
        let tree = TempTree::new();
        let service = service(&tree, RasterSpec::new(240, 240, 256), &["home"]);
        tree.write_image(&tree.bucket("home").join("a.jpg"), 64, 64, RED);
        service.rescan().await.expect("scan");

        let key = address(20);
        let first = service.get_chunk(&key, 0).await.expect("chunk 0");
        let last = service.get_chunk(&key, 224).await.expect("last chunk");
        assert_eq!(first.len(), 512);
        assert_eq!(last.len(), 512);

        let frame = pull(&service, &key).await;
        assert_eq!(frame.len(), 240 * 240 * 2);
        for pixel in frame.chunks_exact(2).step_by(97) {
            let [r, g, b] = rgb565_to_rgb(u16::from_be_bytes([pixel[0], pixel[1]]));
            assert!(r >= 230 && g <= 24 && b <= 24, "not red: {r},{g},{b}");
        }
    }

    #[tokio::test]
    async fn chunk_before_zero_is_a_sequence_error() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        tree.write_image(&tree.bucket("home").join("a.png"), 16, 16, RED);
        service.rescan().await.expect("scan");
        let err = service.get_chunk(&address(1), 5).await.expect_err("no session");
        assert!(matches!(err, PhotoframeError::Sequence));
    }

    #[tokio::test]
    async fn out_of_range_indices_are_rejected() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        tree.write_image(&tree.bucket("home").join("a.png"), 16, 16, RED);
        service.rescan().await.expect("scan");
        let key = address(1);
        service.get_chunk(&key, 0).await.expect("chunk 0");
        for n in [16, 17, -1, i64::MIN] {
            let err = service.get_chunk(&key, n).await.expect_err("out of range");
            assert!(matches!(err, PhotoframeError::Range { .. }), "n={n}");
        }
    }

    #[tokio::test]
    async fn empty_bucket_has_no_content() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        service.rescan().await.expect("scan");
        let err = service.get_chunk(&address(1), 0).await.expect_err("empty");
        assert!(matches!(err, PhotoframeError::NoContent { .. }));
    }

    #[tokio::test]
    async fn chunk_zero_starts_a_new_generation() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        tree.write_image(&tree.bucket("home").join("red.png"), 16, 16, RED);
        tree.write_image(&tree.bucket("home").join("blue.png"), 16, 16, BLUE);
        service.rescan().await.expect("scan");

        let key = address(3);
        let mut generations = HashSet::new();
        let mut colors = HashSet::new();
        for _ in 0..24 {
            let zero = service.get_chunk(&key, 0).await.expect("chunk 0");
            generations.insert(service.sessions().generation(&key).expect("pinned"));
            // Mid-sequence chunks must come from the raster pinned by this chunk 0.
            let mid = service.get_chunk(&key, 9).await.expect("chunk 9");
            assert_eq!(first_pixel(&zero), first_pixel(&mid));
            colors.insert(first_pixel(&zero));
        }
        assert_eq!(generations.len(), 24);
        assert_eq!(colors.len(), 2);
    }

    #[tokio::test]
    async fn pinned_raster_survives_bucket_changes() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        let dir = tree.bucket("home");
        tree.write_image(&dir.join("red.png"), 16, 16, RED);
        service.rescan().await.expect("scan");

        let key = address(4);
        service.get_chunk(&key, 0).await.expect("chunk 0");
        std::fs::remove_file(dir.join("red.png")).expect("remove");
        tree.write_image(&dir.join("blue.png"), 16, 16, BLUE);
        service.rescan().await.expect("rescan");

        let chunk = service.get_chunk(&key, 15).await.expect("still pinned");
        assert_eq!(first_pixel(&chunk), [255, 0, 0]);
        let fresh = service.get_chunk(&key, 0).await.expect("new generation");
        assert_eq!(first_pixel(&fresh), [0, 0, 255]);
    }

    #[tokio::test]
    async fn concurrent_clients_get_independent_sessions() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        tree.write_image(&tree.bucket("home").join("red.png"), 16, 16, RED);
        service.rescan().await.expect("scan");

        let (a, b) = (address(10), address(11));
        let (ra, rb) = tokio::join!(service.get_chunk(&a, 0), service.get_chunk(&b, 0));
        assert!(ra.is_ok() && rb.is_ok());
        let ga = service.sessions().generation(&a).expect("a pinned");
        let gb = service.sessions().generation(&b).expect("b pinned");
        assert_ne!(ga, gb);
        assert_eq!(pull(&service, &a).await, pull(&service, &b).await);
    }

    #[tokio::test]
    async fn unreadable_bucket_keeps_persisted_rasters() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        let dir = tree.bucket("home");
        tree.write_image(&dir.join("red.png"), 16, 16, RED);
        service.rescan().await.expect("scan");
        service.get_chunk(&address(6), 0).await.expect("chunk 0");
        let persisted = tree.cache_dir().join("home").join("red.png.16x16.rgb565");
        assert!(persisted.exists());

        let aside = tree.root.join("aside");
        std::fs::rename(&dir, &aside).expect("unmount");
        assert_eq!(service.rescan().await.expect("rescan"), 0);
        std::fs::rename(&aside, &dir).expect("remount");
        assert_eq!(service.rescan().await.expect("rescan"), 0);

        assert!(persisted.exists());
        service.get_chunk(&address(7), 0).await.expect("still selectable");
    }

    #[tokio::test]
    async fn uploaded_photo_is_selectable_right_away() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home", "office"]);
        service.rescan().await.expect("scan");
        let staged = tree.root.join("staged.png");
        tree.write_image(&staged, 16, 16, BLUE);
        let bytes = std::fs::read(&staged).expect("read staged");

        let stored = service.upload(None, "png", &bytes).await.expect("upload");
        assert_eq!(stored.bucket, "home");
        let listing = service.list_images(None).expect("list");
        assert_eq!(listing.images, vec![stored.name.clone()]);
        let chunk = service.get_chunk(&address(8), 0).await.expect("chunk 0");
        assert_eq!(first_pixel(&chunk), [0, 0, 255]);

        service
            .delete_image(Some("home"), &stored.name)
            .await
            .expect("delete");
        assert!(service.list_images(None).expect("list").images.is_empty());
        assert!(matches!(
            service.list_images(Some("attic")),
            Err(PhotoframeError::UnknownBucket { .. })
        ));
    }

    struct SlowCodec(Duration);

    impl RasterEncoder for SlowCodec {
        fn encode(&self, path: &Path, spec: &RasterSpec) -> Result<RasterBuffer> {
            std::thread::sleep(self.0);
            ImageCodec::new().encode(path, spec)
        }
    }

    #[tokio::test]
    async fn superseded_chunk_zero_is_not_served() {
        let tree = TempTree::new();
        let dir = tree.bucket("home");
        tree.write_image(&dir.join("red.png"), 16, 16, RED);
        let service = PhotoService::new(
            DeviceRegistry::new("home", ["home".to_string()]),
            PhotoLibrary::new([("home".to_string(), dir)]),
            RasterCache::new(
                SMALL,
                Arc::new(SlowCodec(Duration::from_millis(200))),
                Arc::new(DiskStore::new(tree.cache_dir())),
            ),
            Duration::from_secs(600),
        );
        service.rescan().await.expect("scan");

        let key = address(30);
        let (older, newer) = tokio::join!(service.get_chunk(&key, 0), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            service.get_chunk(&key, 0).await
        });
        assert!(matches!(older, Err(PhotoframeError::Sequence)));
        let newer = newer.expect("newest chunk 0 is served");
        let rest = service.get_chunk(&key, 5).await.expect("chunk 5");
        assert_eq!(first_pixel(&newer), first_pixel(&rest));
    }

    #[tokio::test]
    async fn idle_sessions_are_swept() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        tree.write_image(&tree.bucket("home").join("red.png"), 16, 16, RED);
        service.rescan().await.expect("scan");

        let key = address(5);
        service.get_chunk(&key, 0).await.expect("chunk 0");
        let report = service
            .sweep(Instant::now() + Duration::from_secs(601))
            .expect("sweep");
        assert_eq!(report.sessions, 1);
        let err = service.get_chunk(&key, 5).await.expect_err("evicted");
        assert!(matches!(err, PhotoframeError::Sequence));
    }

    #[tokio::test]
    async fn registration_routes_devices_and_addresses() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home", "melanie"]);
        tree.write_image(&tree.bucket("home").join("red.png"), 16, 16, RED);
        tree.write_image(&tree.bucket("melanie").join("blue.png"), 16, 16, BLUE);
        service.rescan().await.expect("scan");

        let mac: MacAddress = "34:98:7A:07:11:7C".parse().expect("mac");
        let device = ClientKey::Device(mac);
        let chunk = service.get_chunk(&device, 0).await.expect("default bucket");
        assert_eq!(first_pixel(&chunk), [255, 0, 0]);

        service.registry().register(mac, "melanie").expect("register");
        let chunk = service.get_chunk(&device, 0).await.expect("assigned bucket");
        assert_eq!(first_pixel(&chunk), [0, 0, 255]);

        let ip = IpAddr::from([192, 168, 1, 77]);
        let registration = service.register_address(ip, mac).expect("bind");
        assert_eq!(registration.bucket, "melanie");
        let by_address = ClientKey::Address(ip);
        let chunk = service.get_chunk(&by_address, 0).await.expect("via address");
        assert_eq!(first_pixel(&chunk), [0, 0, 255]);

        let report = service
            .sweep(Instant::now() + Duration::from_secs(601))
            .expect("sweep");
        assert_eq!(report.addresses, 1);
        let chunk = service.get_chunk(&by_address, 0).await.expect("back to default");
        assert_eq!(first_pixel(&chunk), [255, 0, 0]);
    }

    #[tokio::test]
    async fn undecodable_images_are_excluded() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        tree.write_bytes(&tree.bucket("home").join("broken.jpg"), b"not a jpeg");
        service.rescan().await.expect("scan");

        let key = address(6);
        let err = service.get_chunk(&key, 0).await.expect_err("decode failure");
        assert!(matches!(err, PhotoframeError::Decode { .. }));
        let err = service.get_chunk(&key, 0).await.expect_err("now excluded");
        assert!(matches!(err, PhotoframeError::NoContent { .. }));
        assert_eq!(service.status().buckets[0].rejected, vec!["broken.jpg".to_string()]);
    }

    #[tokio::test]
    async fn new_files_become_selectable_after_rescan() {
        let tree = TempTree::new();
        let service = service(&tree, SMALL, &["home"]);
        service.rescan().await.expect("scan");
        let key = address(8);
        assert!(service.get_chunk(&key, 0).await.is_err());

        tree.write_image(&tree.bucket("home").join("red.png"), 16, 16, RED);
        assert!(service.get_chunk(&key, 0).await.is_err());
        assert_eq!(service.rescan().await.expect("rescan"), 1);
        service.get_chunk(&key, 0).await.expect("selectable now");
        assert_eq!(service.status().cached_rasters, 1);
    }
}
