use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use thiserror::Error;

use crate::cache::sanitize_cache_segment;

pub const WATCHED_EPISODES_KEY: &str = "watchedEpisodes";
pub const CONTINUE_WATCHING_KEY: &str = "continueWatching";
pub const PLAYBACK_POSITIONS_KEY: &str = "playbackPositions";
pub const EPISODE_RATINGS_KEY: &str = "episodeRatings";
pub const USER_EPISODE_RATINGS_KEY: &str = "userEpisodeRatings";
pub const USER_PROFILE_KEY: &str = "userProfile";
pub const PROFILES_KEY: &str = "aniverse_profiles";
pub const ACTIVE_PROFILE_KEY: &str = "aniverse_active_profile";
pub const CLIPS_META_KEY: &str = "aniVerseClipsMeta";
pub const OFFLINE_DOWNLOADS_KEY: &str = "aniverseOfflineDownloads";
pub const THEME_KEY: &str = "aniverse_theme";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode value for key `{key}`")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist key `{key}`")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Raw string storage underneath [`KvStore`].
pub trait StoreBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> io::Result<()>;
    fn remove(&self, key: &str) -> io::Result<()>;
}

#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key. Writes go through a temp file and a rename
/// so a key is either fully old or fully new on disk.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_cache_segment(key)))
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Shared JSON key-value store. Cloning yields another handle onto the same
/// backend.
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn StoreBackend>,
}

impl KvStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(FileBackend::new(dir))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }

    /// Missing keys and undecodable values both yield `default`.
    pub fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.backend.get(key) else {
            return default;
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding unreadable stored value");
                default
            }
        }
    }

    pub fn read_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.read(key, T::default())
    }

    pub fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.backend.set(key, &data).map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(key).map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })
    }

    pub fn theme(&self) -> Theme {
        self.read(THEME_KEY, Theme::default())
    }

    pub fn set_theme(&self, theme: Theme) -> Result<(), StoreError> {
        self.write(THEME_KEY, &theme)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}
