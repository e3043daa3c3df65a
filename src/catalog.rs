use reqwest::Client;
use std::{fs, path::Path};
use thiserror::Error;

use crate::types::{Anime, AnimeKind};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("catalog is not a valid anime list")]
    Parse(#[from] serde_json::Error),
}

type LoadedCallback = Box<dyn FnOnce(&[Anime]) + Send>;

/// In-memory anime list, loaded once per session.
#[derive(Default)]
pub struct Catalog {
    anime: Vec<Anime>,
    loaded: bool,
    subscribers: Vec<LoadedCallback>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_anime(anime: Vec<Anime>) -> Self {
        Self {
            anime,
            loaded: true,
            subscribers: Vec::new(),
        }
    }

    /// Run `callback` once the catalog has loaded. Subscribers registered
    /// after the load run immediately.
    pub fn subscribe(&mut self, callback: impl FnOnce(&[Anime]) + Send + 'static) {
        if self.loaded {
            callback(&self.anime);
        } else {
            self.subscribers.push(Box::new(callback));
        }
    }

    /// Loads from a file path or an http(s) URL. A failed load leaves the
    /// catalog empty but still counts as loaded.
    pub async fn load(&mut self, source: &str, http: &Client) -> usize {
        self.anime = match fetch_catalog(source, http).await {
            Ok(anime) => anime,
            Err(err) => {
                tracing::error!(source, error = %err, "catalog load failed");
                Vec::new()
            }
        };
        self.loaded = true;
        tracing::info!(count = self.anime.len(), "catalog loaded");
        for callback in self.subscribers.drain(..) {
            callback(&self.anime);
        }
        self.anime.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, id: &str) -> Option<&Anime> {
        self.anime.iter().find(|a| a.id == id)
    }

    pub fn by_type(&self, kind: &AnimeKind) -> Vec<&Anime> {
        self.anime.iter().filter(|a| &a.kind == kind).collect()
    }

    pub fn search(&self, query: &str) -> Vec<&Anime> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.anime.iter().collect();
        }
        self.anime
            .iter()
            .filter(|a| a.title.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn sorted_by_title(&self) -> Vec<&Anime> {
        let mut sorted: Vec<&Anime> = self.anime.iter().collect();
        sorted.sort_by_key(|a| a.title.to_lowercase());
        sorted
    }

    /// Newest first by year; entries without a year sink to the end.
    pub fn latest(&self, limit: usize) -> Vec<&Anime> {
        let mut sorted: Vec<&Anime> = self.anime.iter().collect();
        sorted.sort_by(|a, b| b.year.cmp(&a.year));
        sorted.truncate(limit);
        sorted
    }
}

pub async fn fetch_catalog(source: &str, http: &Client) -> Result<Vec<Anime>, CatalogError> {
    let raw = if source.starts_with("http://") || source.starts_with("https://") {
        http.get(source)
            .header("Accept", "application/json")
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|source_err| CatalogError::Http {
                url: source.to_string(),
                source: source_err,
            })?
            .text()
            .await
            .map_err(|source_err| CatalogError::Http {
                url: source.to_string(),
                source: source_err,
            })?
    } else {
        fs::read_to_string(Path::new(source)).map_err(|err| CatalogError::Read {
            path: source.to_string(),
            source: err,
        })?
    };
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    const SAMPLE: &str = r#"[
        {"id": "1", "title": "naruto", "type": "anime", "year": 2002},
        {"id": "2", "title": "Akira", "type": "movie", "year": 1988},
        {"id": "3", "title": "Frieren", "type": "anime", "year": 2023}
    ]"#;

    #[tokio::test]
    async fn loads_file_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anime-data.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = Catalog::new();
        let counter = Arc::clone(&hits);
        catalog.subscribe(move |anime| {
            assert_eq!(anime.len(), 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let count = catalog
            .load(path.to_str().unwrap(), &Client::new())
            .await;
        assert_eq!(count, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&hits);
        catalog.subscribe(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_file_yields_empty_catalog() {
        let mut catalog = Catalog::new();
        let count = catalog
            .load("/definitely/not/here.json", &Client::new())
            .await;
        assert_eq!(count, 0);
        assert!(catalog.is_loaded());
    }

    #[test]
    fn views_filter_and_sort() {
        let anime: Vec<Anime> = serde_json::from_str(SAMPLE).unwrap();
        let catalog = Catalog::from_anime(anime);

        assert_eq!(catalog.by_type(&AnimeKind::Movie).len(), 1);
        assert_eq!(catalog.search("FRIE").len(), 1);
        assert_eq!(catalog.search("  ").len(), 3);

        let titles: Vec<&str> = catalog
            .sorted_by_title()
            .iter()
            .map(|a| a.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Akira", "Frieren", "naruto"]);

        let latest = catalog.latest(2);
        assert_eq!(latest[0].id, "3");
        assert_eq!(latest[1].id, "1");
        assert_eq!(catalog.get("2").map(|a| a.title.as_str()), Some("Akira"));
    }
}
