//! Operational helpers: logging setup and on-disk layout checks.

use std::path::{Path, PathBuf};

use photoframe_types::{
    config::{LibraryConfig, OpsConfig},
    PhotoframeError, Result,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Build the log filter.
///
/// An explicit `level_override` wins; otherwise `RUST_LOG`, then the configured
/// level, then `info`.
pub fn log_filter(config: &OpsConfig, level_override: Option<&str>) -> Result<EnvFilter> {
    let filter = match level_override {
        Some(level) => EnvFilter::try_new(level),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level)),
    };
    filter
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| PhotoframeError::Ops(format!("failed to create log filter: {err}")))
}

pub fn init_tracing(config: &OpsConfig, level_override: Option<&str>) -> Result<()> {
    fmt()
        .with_env_filter(log_filter(config, level_override)?)
        .try_init()
        .map_err(|err| PhotoframeError::Ops(format!("tracing init error: {err}")))?;
    Ok(())
}

pub fn ensure_cache_dir(path: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = path.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)
        .map_err(|err| PhotoframeError::Ops(format!("failed to create cache dir: {err}")))?;
    info!("Raster cache directory ready at {:?}", dir);
    Ok(dir)
}

/// Warn about bucket directories that do not exist yet. Returns their names.
///
/// Missing directories are not fatal; the bucket just serves nothing until
/// photos appear.
pub fn check_bucket_dirs(library: &LibraryConfig) -> Vec<String> {
    library
        .buckets
        .iter()
        .filter(|(_, dir)| !Path::new(dir).is_dir())
        .map(|(name, dir)| {
            warn!("Bucket {} directory {:?} does not exist", name, dir);
            name.clone()
        })
        .collect()
}
