//! Chunk protocol service: routes clients to buckets, pins rasters per
//! session and keeps bucket contents and idle state tidy in the background.

pub mod library;
pub mod service;
pub mod tasks;

pub use library::{BucketChange, BucketSummary, PhotoLibrary};
pub use service::{BucketListing, PhotoService, ServiceStatus, StoredImage, SweepReport};
pub use tasks::{spawn_background, BackgroundTasks};

#[cfg(test)]
pub(crate) mod testing;
