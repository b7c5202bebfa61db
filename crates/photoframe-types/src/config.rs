use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{device::MacAddress, raster::RasterSpec, PhotoframeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_addr: String,
    pub chunk_port: u16,
    pub registration_port: u16,
    /// Reject chunk requests that do not carry a `mac` query parameter.
    #[serde(default)]
    pub require_mac: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub default_bucket: String,
    pub cache_dir: String,
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    /// Bucket name to photo directory.
    pub buckets: BTreeMap<String, String>,
}

impl LibraryConfig {
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    pub log_level: String,
}

/// A display board known ahead of time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub mac: MacAddress,
    pub bucket: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoframeConfig {
    pub raster: RasterSpec,
    pub network: NetworkConfig,
    pub library: LibraryConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    pub ops: OpsConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_rescan_interval_secs() -> u64 {
    30
}

impl PhotoframeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            PhotoframeError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        Self::parse(&contents).map_err(|err| {
            PhotoframeError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<()> {
        let raster = &self.raster;
        if raster.width == 0 || raster.height == 0 {
            return Err(PhotoframeError::Configuration(
                "raster.width and raster.height must be greater than zero".into(),
            ));
        }
        if raster.width != raster.height {
            return Err(PhotoframeError::Configuration(format!(
                "raster output must be square, got {}x{}",
                raster.width, raster.height
            )));
        }
        if raster.pixels_per_chunk == 0
            || raster.total_pixels() % raster.pixels_per_chunk as usize != 0
        {
            return Err(PhotoframeError::Configuration(format!(
                "raster.pixels_per_chunk must evenly divide {} pixels",
                raster.total_pixels()
            )));
        }
        if self.network.chunk_port == 0 || self.network.registration_port == 0 {
            return Err(PhotoframeError::Configuration(
                "network ports must be valid ports (>0)".into(),
            ));
        }
        if self.network.chunk_port == self.network.registration_port {
            return Err(PhotoframeError::Configuration(
                "network.chunk_port and network.registration_port must differ".into(),
            ));
        }
        if self.library.buckets.is_empty() {
            return Err(PhotoframeError::Configuration(
                "library.buckets must name at least one bucket".into(),
            ));
        }
        if !self
            .library
            .buckets
            .contains_key(&self.library.default_bucket)
        {
            return Err(PhotoframeError::Configuration(format!(
                "library.default_bucket {:?} is not a configured bucket",
                self.library.default_bucket
            )));
        }
        if self.library.rescan_interval_secs == 0 {
            return Err(PhotoframeError::Configuration(
                "library.rescan_interval_secs must be greater than zero".into(),
            ));
        }
        if self.sessions.idle_timeout_secs == 0 || self.sessions.sweep_interval_secs == 0 {
            return Err(PhotoframeError::Configuration(
                "session timeouts and intervals must be greater than zero".into(),
            ));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.mac) {
                return Err(PhotoframeError::Configuration(format!(
                    "device {} is listed more than once",
                    device.mac
                )));
            }
            if !self.library.buckets.contains_key(&device.bucket) {
                return Err(PhotoframeError::Configuration(format!(
                    "device {} refers to unknown bucket {:?}",
                    device.mac, device.bucket
                )));
            }
        }
        Ok(())
    }
}
