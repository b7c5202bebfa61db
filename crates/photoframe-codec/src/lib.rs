//! Photo to RGB565 raster conversion.

use std::path::Path;

use image::{imageops, imageops::FilterType, io::Reader as ImageReader, DynamicImage, RgbImage};
use photoframe_types::{
    raster::{RasterBuffer, RasterSpec},
    PhotoframeError, Result,
};
use tracing::debug;

/// File extensions the codec accepts, lowercase and without the dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Pack an 8-bit RGB triple into RGB565.
pub fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3)
}

/// Expand RGB565 back to 8-bit channels by bit replication.
pub fn rgb565_to_rgb(value: u16) -> [u8; 3] {
    let r = ((value >> 11) & 0x1F) as u8;
    let g = ((value >> 5) & 0x3F) as u8;
    let b = (value & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

/// Turns a source image file into a display-ready frame.
pub trait RasterEncoder: Send + Sync {
    fn encode(&self, path: &Path, spec: &RasterSpec) -> Result<RasterBuffer>;
}

/// Decoder backed by the `image` crate: fit, letterbox on black, pack RGB565.
#[derive(Debug, Clone, Copy)]
pub struct ImageCodec {
    filter: FilterType,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl ImageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(&self, path: &Path) -> Result<DynamicImage> {
        let decode_error = |reason: String| PhotoframeError::Decode {
            path: path.to_path_buf(),
            reason,
        };
        ImageReader::open(path)
            .map_err(|err| decode_error(err.to_string()))?
            .with_guessed_format()
            .map_err(|err| decode_error(err.to_string()))?
            .decode()
            .map_err(|err| decode_error(err.to_string()))
    }

    /// Fit `image` inside the target, centre it on a black canvas and pack it.
    pub fn rasterize(&self, image: DynamicImage, spec: &RasterSpec) -> Result<RasterBuffer> {
        let (target_w, target_h) = (spec.width, spec.height);
        // Longer side lands on the target, shorter side keeps the aspect ratio.
        let already_fitted = (image.width() == target_w && image.height() <= target_h)
            || (image.height() == target_h && image.width() <= target_w);
        let fitted = if already_fitted {
            image
        } else {
            image.resize(target_w, target_h, self.filter)
        };
        let fitted = fitted.to_rgb8();

        let mut canvas = RgbImage::new(target_w, target_h);
        let x = (target_w - fitted.width()) / 2;
        let y = (target_h - fitted.height()) / 2;
        imageops::replace(&mut canvas, &fitted, x as i64, y as i64);

        let mut data = Vec::with_capacity(spec.byte_len());
        for pixel in canvas.pixels() {
            let [r, g, b] = pixel.0;
            data.extend_from_slice(&rgb565(r, g, b).to_be_bytes());
        }
        RasterBuffer::new(target_w, target_h, data)
    }
}

impl RasterEncoder for ImageCodec {
    fn encode(&self, path: &Path, spec: &RasterSpec) -> Result<RasterBuffer> {
        if !is_supported(path) {
            return Err(PhotoframeError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
        let image = self.decode(path)?;
        debug!(
            "Decoded {:?} ({}x{}) for {}x{} raster",
            path,
            image.width(),
            image.height(),
            spec.width,
            spec.height
        );
        self.rasterize(image, spec)
    }
}
