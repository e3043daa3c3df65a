use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::cache::{OFFLINE_CACHE_NAME, OfflineCache};
use crate::proxy::{DEFAULT_SHELL_PATHS, PROXY_CACHE_NAME, ProxyOptions};

pub const ENV_PREFIX: &str = "ANIVERSE";
const APP_DIR: &str = "aniverse";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings")]
    Load(#[from] config::ConfigError),
    #[error("failed to render settings")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
    #[error("invalid player command: {0:?}")]
    PlayerCommand(String),
    #[error("invalid proxy origin {origin}")]
    Origin {
        origin: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Catalog JSON: a file path or an http(s) URL.
    pub catalog: String,
    /// Player command line, split like a shell would.
    pub player: String,
    pub ffmpeg: String,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub origin: Option<String>,
    pub shell_paths: Vec<String>,
    pub port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            origin: None,
            shell_paths: DEFAULT_SHELL_PATHS.iter().map(|p| p.to_string()).collect(),
            port: 0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs_next::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let cache_dir = dirs_next::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            catalog: data_dir.join("anime-data.json").display().to_string(),
            data_dir,
            cache_dir,
            player: "mpv".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            proxy: ProxySettings::default(),
        }
    }
}

impl Settings {
    pub fn config_path() -> PathBuf {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Built-in defaults, then the file at `path`, then `ANIVERSE_*`
    /// environment variables (`ANIVERSE_PROXY__PORT` for nested keys).
    /// `env` replaces the process environment when given.
    pub fn load_from(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("proxy.shell_paths")
            .try_parsing(true)
            .source(env);
        let settings: Settings = builder.add_source(environment).build()?.try_deserialize()?;
        tracing::debug!(?settings, "settings loaded");
        Ok(settings)
    }

    /// Writes the defaults as TOML; refuses to overwrite unless `force`.
    pub fn write_default(path: &Path, force: bool) -> Result<(), ConfigError> {
        if path.exists() && !force {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(&Settings::default())?;
        std::fs::write(path, content).map_err(io_err)
    }

    pub fn player_command(&self) -> Result<Vec<String>, ConfigError> {
        match shlex::split(&self.player) {
            Some(parts) if !parts.is_empty() => Ok(parts),
            _ => Err(ConfigError::PlayerCommand(self.player.clone())),
        }
    }

    pub fn proxy_options(&self) -> Result<ProxyOptions, ConfigError> {
        let origin = self
            .proxy
            .origin
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .map(|origin| {
                // Without the trailing slash `join` would drop the last segment.
                let normalized = if origin.ends_with('/') {
                    origin.to_string()
                } else {
                    format!("{origin}/")
                };
                Url::parse(&normalized).map_err(|source| ConfigError::Origin {
                    origin: origin.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(ProxyOptions {
            origin,
            shell_paths: self.proxy.shell_paths.clone(),
            port: self.proxy.port,
        })
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.data_dir.join("clips")
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.cache_dir.join("capture")
    }

    pub fn offline_cache(&self) -> OfflineCache {
        OfflineCache::open(&self.cache_dir, OFFLINE_CACHE_NAME)
    }

    pub fn proxy_cache(&self) -> OfflineCache {
        OfflineCache::open(&self.cache_dir, PROXY_CACHE_NAME)
    }
}
