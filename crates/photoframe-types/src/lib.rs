//! Shared domain types for the photoframe project.

pub mod config;
pub mod device;
pub mod raster;

mod errors;

pub use errors::{PhotoframeError, Result};
