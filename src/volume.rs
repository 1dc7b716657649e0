use std::fs;
use std::io;
use std::path::PathBuf;
use log::warn;

use crate::mp3::{MAX_VOLUME, MIN_VOLUME};

/// Persists the playback volume across restarts.
pub trait VolumeStore {
    /// Reads the stored volume, if a valid one exists.
    fn load(&self) -> Option<u8>;

    /// Stores a new volume level.
    fn save(&mut self, level: u8) -> io::Result<()>;
}

/// Volume store backed by a small text file.
pub struct FileVolumeStore {
    path: PathBuf,
}

impl FileVolumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VolumeStore for FileVolumeStore {
    fn load(&self) -> Option<u8> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match contents.trim().parse::<u8>() {
            Ok(level) if (MIN_VOLUME..=MAX_VOLUME).contains(&level) => Some(level),
            _ => {
                warn!("Ignoring invalid persisted volume in {}", self.path.display());
                None
            }
        }
    }

    fn save(&mut self, level: u8) -> io::Result<()> {
        fs::write(&self.path, format!("{}\n", level))
    }
}
