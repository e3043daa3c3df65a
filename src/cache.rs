use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use url::Url;

pub const OFFLINE_CACHE_NAME: &str = "aniverse-offline-v2";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub size: u64,
    pub stored_at: i64,
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub meta: CacheMeta,
    pub body: Vec<u8>,
}

/// Named on-disk cache mapping a source URL to a stored response body.
/// Each entry is a body file plus a `.meta.json` sidecar carrying the URL.
#[derive(Debug, Clone)]
pub struct OfflineCache {
    dir: PathBuf,
}

impl OfflineCache {
    pub fn open(base: &Path, name: &str) -> Self {
        Self {
            dir: base.join(sanitize_cache_segment(name)),
        }
    }

    fn entry_stem(url: &str) -> String {
        format!("{:016x}", fnv1a64(url))
    }

    fn body_file(&self, url: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            Self::entry_stem(url),
            infer_media_extension(url)
        ))
    }

    fn meta_file(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", Self::entry_stem(url)))
    }

    pub fn put(&self, url: &str, body: &[u8], content_type: Option<&str>) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let body_path = self.body_file(url);
        let tmp = body_path.with_extension("part");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &body_path)?;

        let meta = CacheMeta {
            url: url.to_string(),
            content_type: content_type.map(str::to_string),
            size: body.len() as u64,
            stored_at: Utc::now().timestamp_millis(),
        };
        let data = serde_json::to_vec_pretty(&meta).map_err(io::Error::other)?;
        fs::write(self.meta_file(url), data)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.body_file(url).is_file() && self.meta_file(url).is_file()
    }

    pub fn body_path(&self, url: &str) -> Option<PathBuf> {
        self.contains(url).then(|| self.body_file(url))
    }

    pub fn meta(&self, url: &str) -> Option<CacheMeta> {
        let data = fs::read(self.meta_file(url)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    pub fn read(&self, url: &str) -> io::Result<Option<CachedResponse>> {
        let Some(meta) = self.meta(url) else {
            return Ok(None);
        };
        match fs::read(self.body_file(url)) {
            Ok(body) => Ok(Some(CachedResponse { meta, body })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Playable `file://` URL for a cached body.
    pub fn blob_url(&self, url: &str) -> Option<Url> {
        let path = self.body_path(url)?;
        let absolute = fs::canonicalize(&path).unwrap_or(path);
        Url::from_file_path(absolute).ok()
    }

    /// Returns whether anything was evicted.
    pub fn remove(&self, url: &str) -> io::Result<bool> {
        let mut removed = false;
        for path in [self.body_file(url), self.meta_file(url)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    pub fn urls(&self) -> Vec<String> {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".meta.json"))
            .filter_map(|entry| fs::read(entry.path()).ok())
            .filter_map(|data| serde_json::from_slice::<CacheMeta>(&data).ok())
            .map(|meta| meta.url)
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.urls()
            .iter()
            .filter_map(|url| self.meta(url))
            .map(|meta| meta.size)
            .sum()
    }
}

fn fnv1a64(value: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in value.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub fn sanitize_cache_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        String::from("unknown")
    } else {
        cleaned
    }
}

pub fn infer_media_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext)
            if matches!(
                ext.as_str(),
                "mp4" | "webm" | "mkv" | "m3u8" | "ts" | "mp3" | "m4a" | "ogg" | "opus" | "jpg"
                    | "png" | "webp" | "json" | "html" | "js" | "css"
            ) =>
        {
            ext
        }
        _ => String::from("bin"),
    }
}
