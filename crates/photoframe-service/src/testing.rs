use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use image::{ImageBuffer, Rgb};

/// Scratch directory tree removed on drop.
pub struct TempTree {
    pub root: PathBuf,
}

impl TempTree {
    pub fn new() -> Self {
        let root =
            std::env::temp_dir().join(format!("photoframe-service-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).expect("create temp root");
        Self { root }
    }

    pub fn bucket(&self, name: &str) -> PathBuf {
        let dir = self.root.join("photos").join(name);
        fs::create_dir_all(&dir).expect("create bucket dir");
        dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn write_bytes(&self, path: &Path, bytes: &[u8]) {
        fs::write(path, bytes).expect("write file");
    }

    pub fn write_image(&self, path: &Path, width: u32, height: u32, color: [u8; 3]) {
        ImageBuffer::<Rgb<u8>, _>::from_pixel(width, height, Rgb(color))
            .save(path)
            .expect("save image");
    }

    /// Push the file's modification time a minute into the future.
    pub fn touch(&self, path: &Path) {
        fs::File::options()
            .write(true)
            .open(path)
            .and_then(|file| file.set_modified(SystemTime::now() + Duration::from_secs(60)))
            .expect("touch file");
    }
}

impl Drop for TempTree {
    fn drop(&mut self) {
        fs::remove_dir_all(&self.root).ok();
    }
}
