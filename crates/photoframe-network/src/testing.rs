use std::{fs, io::Cursor, path::PathBuf, sync::Arc, time::Duration};

use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use photoframe_cache::{DiskStore, RasterCache};
use photoframe_codec::ImageCodec;
use photoframe_registry::DeviceRegistry;
use photoframe_service::{PhotoLibrary, PhotoService};
use photoframe_types::raster::RasterSpec;

pub const RED: [u8; 3] = [255, 0, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const OFFICE_MAC: &str = "34:98:7A:07:11:7C";

/// Service over a scratch tree with a `home` default bucket and an `office`
/// bucket assigned to [`OFFICE_MAC`]. Images land in `home`.
pub struct Fixture {
    pub root: PathBuf,
    pub service: Arc<PhotoService>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        fs::remove_dir_all(&self.root).ok();
    }
}

pub async fn service_with_images(images: &[(&str, [u8; 3])]) -> Fixture {
    let root = std::env::temp_dir().join(format!("photoframe-network-{}", uuid::Uuid::new_v4()));
    let home = root.join("photos").join("home");
    let office = root.join("photos").join("office");
    fs::create_dir_all(&home).expect("home dir");
    fs::create_dir_all(&office).expect("office dir");
    for (name, color) in images {
        ImageBuffer::<Rgb<u8>, _>::from_pixel(16, 16, Rgb(*color))
            .save(home.join(name))
            .expect("save image");
    }

    let registry = DeviceRegistry::new("home", ["home".to_string(), "office".to_string()]);
    registry
        .register(OFFICE_MAC.parse().expect("mac"), "office")
        .expect("register");
    let library = PhotoLibrary::new([
        ("home".to_string(), home),
        ("office".to_string(), office),
    ]);
    let cache = RasterCache::new(
        RasterSpec::new(16, 16, 16),
        Arc::new(ImageCodec::new()),
        Arc::new(DiskStore::new(root.join("cache"))),
    );
    let service = PhotoService::new(registry, library, cache, Duration::from_secs(600));
    service.rescan().await.expect("rescan");
    Fixture {
        root,
        service: Arc::new(service),
    }
}

/// A 16x16 PNG of one colour, encoded in memory.
pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(16, 16, Rgb(color)))
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .expect("encode png");
    bytes
}
