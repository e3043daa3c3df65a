use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::cache::OfflineCache;
use crate::store::{KvStore, OFFLINE_DOWNLOADS_KEY, StoreError};
use crate::types::{Anime, Track};

pub const DOWNLOAD_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed for {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("offline cache error")]
    Cache(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Percent(u8),
    Indeterminate,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Byte transport used to fill the offline cache.
pub trait Transport {
    async fn fetch(
        &self,
        url: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<Fetched, DownloadError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> reqwest::Result<Self> {
        Ok(Self {
            client: build_download_http_client()?,
        })
    }
}

pub fn build_download_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(DOWNLOAD_USER_AGENT)
        .redirect(reqwest::redirect::Policy::custom(|attempt| {
            if attempt.previous().len() > 5 {
                attempt.stop()
            } else {
                attempt.follow()
            }
        }))
        .build()
}

impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<Fetched, DownloadError> {
        let request_err = |source| DownloadError::Request {
            url: url.to_string(),
            source,
        };
        let mut resp = self.client.get(url).send().await.map_err(request_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match resp.content_length().filter(|len| *len > 0) {
            Some(total) => {
                let mut body = Vec::with_capacity(total.min(64 * 1024 * 1024) as usize);
                let mut last = None;
                while let Some(chunk) = resp.chunk().await.map_err(request_err)? {
                    body.extend_from_slice(&chunk);
                    let percent = ((body.len() as u64 * 100) / total).min(100) as u8;
                    if last != Some(percent) {
                        last = Some(percent);
                        on_progress(Progress::Percent(percent));
                    }
                }
                body
            }
            None => {
                on_progress(Progress::Indeterminate);
                resp.bytes().await.map_err(request_err)?.to_vec()
            }
        };
        Ok(Fetched { body, content_type })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Episode,
    Music,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: DownloadKind,
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub url: String,
}

impl DownloadItem {
    pub fn episode(anime: &Anime, season: u32, episode: usize) -> Option<Self> {
        let ep = anime.episode(season, episode)?;
        let url = ep.primary_source()?;
        let title = if ep.title.is_empty() {
            format!("{} S{} E{}", anime.title, season, episode + 1)
        } else {
            format!("{} \u{00b7} {}", anime.title, ep.title)
        };
        Some(Self {
            key: episode_key(&anime.id, season, episode),
            kind: DownloadKind::Episode,
            title,
            thumbnail: ep
                .thumbnail
                .clone()
                .or_else(|| anime.image().map(str::to_string)),
            url,
        })
    }

    pub fn music(track: &Track) -> Self {
        Self {
            key: music_key(&track.url),
            kind: DownloadKind::Music,
            title: track.title.clone(),
            thumbnail: track.thumbnail.clone(),
            url: track.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    #[serde(flatten)]
    pub item: DownloadItem,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadState {
    InProgress(Progress),
    Done,
    Failed(String),
}

impl DownloadState {
    pub fn label(&self) -> String {
        match self {
            DownloadState::InProgress(Progress::Percent(p)) => format!("{p}%"),
            DownloadState::InProgress(Progress::Indeterminate) => String::from("Downloading..."),
            DownloadState::Done => String::from("Downloaded"),
            DownloadState::Failed(_) => String::from("Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    AlreadyDownloaded,
    Downloaded,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub total: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearReport {
    pub removed: usize,
    pub eviction_failures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairReport {
    pub dropped_records: Vec<String>,
    pub orphaned_blobs: Vec<String>,
}

pub fn episode_key(anime_id: &str, season: u32, episode: usize) -> String {
    format!("ep-{anime_id}-{season}-{episode}")
}

pub fn music_key(url: &str) -> String {
    format!("music-{}", string_hash_base36(url))
}

/// 31-multiplier string hash over UTF-16 code units, rendered in base 36.
fn string_hash_base36(value: &str) -> String {
    let mut hash: i32 = 0;
    for unit in value.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    let mut n = hash.unsigned_abs();
    if n == 0 {
        return String::from("0");
    }
    let mut digits = Vec::new();
    while n > 0 {
        let d = (n % 36) as u8;
        digits.push(if d < 10 { b'0' + d } else { b'a' + d - 10 });
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

type StateListener = Box<dyn FnMut(&str, &DownloadState) + Send>;

/// Offline downloads: persisted records plus cached bodies, with per-key
/// progress for anything in flight.
pub struct DownloadManager<T> {
    store: KvStore,
    cache: OfflineCache,
    transport: T,
    states: HashMap<String, DownloadState>,
    listener: Option<StateListener>,
}

impl<T: Transport> DownloadManager<T> {
    pub fn new(store: KvStore, cache: OfflineCache, transport: T) -> Self {
        Self {
            store,
            cache,
            transport,
            states: HashMap::new(),
            listener: None,
        }
    }

    pub fn on_state_change(&mut self, listener: impl FnMut(&str, &DownloadState) + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }

    pub fn list_downloads(&self) -> Vec<DownloadRecord> {
        self.store.read_or_default(OFFLINE_DOWNLOADS_KEY)
    }

    fn save_downloads(&self, records: &[DownloadRecord]) -> Result<(), StoreError> {
        self.store.write(OFFLINE_DOWNLOADS_KEY, records)
    }

    pub fn is_downloaded(&self, key: &str) -> bool {
        self.list_downloads().iter().any(|r| r.item.key == key)
    }

    pub fn progress(&self, key: &str) -> Option<&DownloadState> {
        self.states.get(key)
    }

    fn emit(&mut self, key: &str, state: DownloadState) {
        emit_state(&mut self.states, &mut self.listener, key, state);
    }

    pub async fn download_item(&mut self, item: &DownloadItem) -> DownloadOutcome {
        if self.is_downloaded(&item.key) {
            tracing::debug!(key = %item.key, "already downloaded");
            return DownloadOutcome::AlreadyDownloaded;
        }
        self.emit(&item.key, DownloadState::InProgress(Progress::Percent(0)));

        match self.fetch_and_store(item).await {
            Ok(()) => {
                tracing::info!(key = %item.key, url = %item.url, "download complete");
                self.emit(&item.key, DownloadState::Done);
                DownloadOutcome::Downloaded
            }
            Err(err) => {
                let reason = error_chain(&err);
                tracing::warn!(key = %item.key, error = %reason, "download failed");
                self.emit(&item.key, DownloadState::Failed(reason.clone()));
                DownloadOutcome::Failed(reason)
            }
        }
    }

    async fn fetch_and_store(&mut self, item: &DownloadItem) -> Result<(), DownloadError> {
        let states = &mut self.states;
        let listener = &mut self.listener;
        let key = item.key.as_str();
        let fetched = self
            .transport
            .fetch(&item.url, &mut |progress: Progress| {
                emit_state(states, listener, key, DownloadState::InProgress(progress))
            })
            .await?;
        self.cache
            .put(&item.url, &fetched.body, fetched.content_type.as_deref())?;

        let mut records = self.list_downloads();
        records.push(DownloadRecord {
            item: item.clone(),
            created_at: Utc::now().timestamp_millis(),
        });
        self.save_downloads(&records)?;
        Ok(())
    }

    /// Downloads one item at a time, reporting `done/total` after each.
    pub async fn run_bulk(
        &mut self,
        items: &[DownloadItem],
        mut on_status: impl FnMut(&str),
    ) -> BulkReport {
        let mut report = BulkReport {
            total: items.len(),
            ..Default::default()
        };
        for (idx, item) in items.iter().enumerate() {
            match self.download_item(item).await {
                DownloadOutcome::Downloaded => report.downloaded += 1,
                DownloadOutcome::AlreadyDownloaded => report.skipped += 1,
                DownloadOutcome::Failed(_) => report.failed += 1,
            }
            on_status(&format!("{}/{}", idx + 1, items.len()));
        }
        report
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.cache.contains(url)
    }

    pub fn remove_cached_url(&self, url: &str) -> Result<bool, DownloadError> {
        Ok(self.cache.remove(url)?)
    }

    pub fn get_cached_blob_url(&self, url: &str) -> Option<String> {
        self.cache.blob_url(url).map(|u| u.to_string())
    }

    /// Evicts the body, then drops the record and forgets any progress. A
    /// failed eviction leaves the record in place so the removal can be retried.
    pub fn remove_download(&mut self, key: &str) -> Result<bool, DownloadError> {
        let mut records = self.list_downloads();
        let Some(pos) = records.iter().position(|r| r.item.key == key) else {
            self.states.remove(key);
            return Ok(false);
        };
        if let Err(err) = self.cache.remove(&records[pos].item.url) {
            tracing::warn!(key, error = %err, "cache eviction failed, keeping record");
            return Err(DownloadError::Cache(err));
        }
        records.remove(pos);
        self.save_downloads(&records)?;
        self.states.remove(key);
        Ok(true)
    }

    pub fn clear_downloads(&mut self) -> Result<ClearReport, DownloadError> {
        let records = self.list_downloads();
        let mut report = ClearReport::default();
        for record in &records {
            match self.cache.remove(&record.item.url) {
                Ok(_) => report.removed += 1,
                Err(err) => {
                    tracing::warn!(key = %record.item.key, error = %err, "cache eviction failed");
                    report.eviction_failures.push(record.item.key.clone());
                }
            }
        }
        self.save_downloads(&[])?;
        self.states.clear();
        Ok(report)
    }

    /// Drops records whose body is gone and evicts bodies nothing refers to.
    pub fn repair(&mut self) -> Result<RepairReport, DownloadError> {
        let mut report = RepairReport::default();
        let records = self.list_downloads();
        let (kept, dropped): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| self.cache.contains(&r.item.url));
        report.dropped_records = dropped.into_iter().map(|r| r.item.key).collect();
        if !report.dropped_records.is_empty() {
            self.save_downloads(&kept)?;
        }
        for url in self.cache.urls() {
            if !kept.iter().any(|r| r.item.url == url) {
                self.cache.remove(&url)?;
                report.orphaned_blobs.push(url);
            }
        }
        tracing::info!(
            dropped = report.dropped_records.len(),
            orphaned = report.orphaned_blobs.len(),
            "download repair finished"
        );
        Ok(report)
    }
}

fn emit_state(
    states: &mut HashMap<String, DownloadState>,
    listener: &mut Option<StateListener>,
    key: &str,
    state: DownloadState,
) {
    if let Some(listener) = listener.as_mut() {
        listener(key, &state);
    }
    match state {
        DownloadState::InProgress(_) => {
            states.insert(key.to_string(), state);
        }
        DownloadState::Done | DownloadState::Failed(_) => {
            states.remove(key);
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
