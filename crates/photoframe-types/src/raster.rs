use std::{ops::Range, path::PathBuf, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{PhotoframeError, Result};

pub const BYTES_PER_PIXEL: usize = 2;

/// Output geometry shared by the codec, the cache and the chunk protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterSpec {
    pub width: u32,
    pub height: u32,
    pub pixels_per_chunk: u32,
}

impl RasterSpec {
    pub const fn new(width: u32, height: u32, pixels_per_chunk: u32) -> Self {
        Self {
            width,
            height,
            pixels_per_chunk,
        }
    }

    pub fn total_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_len(&self) -> usize {
        self.total_pixels() * BYTES_PER_PIXEL
    }

    pub fn chunk_size(&self) -> usize {
        self.pixels_per_chunk as usize * BYTES_PER_PIXEL
    }

    pub fn total_chunks(&self) -> usize {
        if self.pixels_per_chunk == 0 {
            return 0;
        }
        self.total_pixels() / self.pixels_per_chunk as usize
    }

    /// Byte range of chunk `index`, or `Range` for anything outside `[0, total_chunks)`.
    pub fn chunk_range(&self, index: i64) -> Result<Range<usize>> {
        let total = self.total_chunks();
        let out_of_range = || PhotoframeError::Range { index, total };
        let idx = usize::try_from(index).map_err(|_| out_of_range())?;
        if idx >= total {
            return Err(out_of_range());
        }
        let start = idx * self.chunk_size();
        Ok(start..start + self.chunk_size())
    }
}

/// A complete RGB565 frame, high byte first, row-major from the top-left.
///
/// Construction checks the length so a partial frame can never be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RasterBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(PhotoframeError::RasterSize {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Big-endian RGB565 value at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        Some(u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
    }

    /// Slice of chunk `index` under `spec`; never padded or truncated.
    pub fn chunk(&self, spec: &RasterSpec, index: i64) -> Result<&[u8]> {
        let range = spec.chunk_range(index)?;
        self.data
            .get(range)
            .ok_or(PhotoframeError::Range {
                index,
                total: spec.total_chunks(),
            })
    }
}

/// An image file discovered in a bucket directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub path: PathBuf,
    /// File name within the bucket directory; the cache keys on it.
    pub name: String,
    pub modified: SystemTime,
}
