use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::store::{
    CONTINUE_WATCHING_KEY, KvStore, PLAYBACK_POSITIONS_KEY, StoreError, WATCHED_EPISODES_KEY,
};

pub const GLOBAL_CONTINUE_LIMIT: usize = 10;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContinueEntry {
    pub anime_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub season: u32,
    /// Zero-based index into the season's episode list.
    pub episode: usize,
    pub progress: f64,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

impl ContinueEntry {
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.updated_at)
    }

    pub fn label(&self) -> String {
        let when = self
            .updated()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        format!(
            "{} \u{00b7} S{} E{} \u{00b7} {:.0}% \u{00b7} {}",
            if self.title.is_empty() {
                &self.anime_id
            } else {
                &self.title
            },
            self.season,
            self.episode + 1,
            self.progress,
            when
        )
    }
}

/// Move `entry` to the front, dropping any older entry for the same anime,
/// then keep only the `limit` most recent.
pub fn upsert_entry(entries: &mut Vec<ContinueEntry>, entry: ContinueEntry, limit: usize) {
    entries.retain(|e| e.anime_id != entry.anime_id);
    entries.insert(0, entry);
    entries.truncate(limit);
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackPosition {
    pub season: u32,
    pub episode: usize,
    pub time: f64,
}

pub fn watched_key(anime_id: &str, season: u32, episode: usize) -> String {
    format!("{anime_id}-{season}-{episode}")
}

/// Global (profile-less) watch state.
#[derive(Clone)]
pub struct WatchHistory {
    store: KvStore,
}

impl WatchHistory {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn continue_watching(&self) -> Vec<ContinueEntry> {
        self.store.read_or_default(CONTINUE_WATCHING_KEY)
    }

    pub fn update_continue_watching(&self, entry: ContinueEntry) -> Result<(), StoreError> {
        let mut entries = self.continue_watching();
        upsert_entry(&mut entries, entry, GLOBAL_CONTINUE_LIMIT);
        self.store.write(CONTINUE_WATCHING_KEY, &entries)
    }

    pub fn remove_continue_watching(&self, anime_id: &str) -> Result<(), StoreError> {
        let mut entries = self.continue_watching();
        entries.retain(|e| e.anime_id != anime_id);
        self.store.write(CONTINUE_WATCHING_KEY, &entries)
    }

    pub fn watched_episodes(&self) -> BTreeSet<String> {
        self.store.read_or_default(WATCHED_EPISODES_KEY)
    }

    pub fn is_watched(&self, anime_id: &str, season: u32, episode: usize) -> bool {
        self.watched_episodes()
            .contains(&watched_key(anime_id, season, episode))
    }

    pub fn mark_watched(&self, anime_id: &str, season: u32, episode: usize) -> Result<(), StoreError> {
        let mut watched = self.watched_episodes();
        if watched.insert(watched_key(anime_id, season, episode)) {
            self.store.write(WATCHED_EPISODES_KEY, &watched)?;
        }
        Ok(())
    }

    pub fn position(&self, anime_id: &str) -> Option<PlaybackPosition> {
        let positions: HashMap<String, PlaybackPosition> =
            self.store.read_or_default(PLAYBACK_POSITIONS_KEY);
        positions.get(anime_id).copied()
    }

    pub fn save_position(&self, anime_id: &str, position: PlaybackPosition) -> Result<(), StoreError> {
        let mut positions: HashMap<String, PlaybackPosition> =
            self.store.read_or_default(PLAYBACK_POSITIONS_KEY);
        positions.insert(anime_id.to_string(), position);
        self.store.write(PLAYBACK_POSITIONS_KEY, &positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(anime_id: &str, updated_at: i64) -> ContinueEntry {
        ContinueEntry {
            anime_id: anime_id.to_string(),
            title: String::new(),
            thumbnail: None,
            season: 1,
            episode: 0,
            progress: 10.0,
            updated_at,
        }
    }

    #[test]
    fn upsert_moves_existing_entry_to_front() {
        let mut entries = vec![entry("a", 1), entry("b", 2)];
        upsert_entry(&mut entries, entry("b", 3), 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].anime_id, "b");
        assert_eq!(entries[0].updated_at, 3);
    }

    #[test]
    fn global_list_is_bounded_to_ten() {
        let history = WatchHistory::new(KvStore::in_memory());
        for i in 0..15 {
            history
                .update_continue_watching(entry(&format!("anime-{i}"), i))
                .unwrap();
        }
        let entries = history.continue_watching();
        assert_eq!(entries.len(), GLOBAL_CONTINUE_LIMIT);
        assert_eq!(entries[0].anime_id, "anime-14");
        assert_eq!(entries[9].anime_id, "anime-5");
    }

    #[test]
    fn watched_and_positions_persist() {
        let store = KvStore::in_memory();
        let history = WatchHistory::new(store.clone());
        history.mark_watched("42", 2, 3).unwrap();
        history
            .save_position(
                "42",
                PlaybackPosition {
                    season: 2,
                    episode: 3,
                    time: 301.5,
                },
            )
            .unwrap();

        let reopened = WatchHistory::new(store);
        assert!(reopened.is_watched("42", 2, 3));
        assert!(!reopened.is_watched("42", 2, 4));
        assert_eq!(reopened.position("42").map(|p| p.time), Some(301.5));
        assert!(reopened.position("7").is_none());
    }
}
