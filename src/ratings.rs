use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::store::{EPISODE_RATINGS_KEY, KvStore, StoreError, USER_EPISODE_RATINGS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Like,
    Dislike,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingCounts {
    pub likes: u32,
    pub dislikes: u32,
}

impl RatingCounts {
    fn bump(&mut self, vote: Vote, up: bool) {
        let slot = match vote {
            Vote::Like => &mut self.likes,
            Vote::Dislike => &mut self.dislikes,
        };
        *slot = if up {
            slot.saturating_add(1)
        } else {
            slot.saturating_sub(1)
        };
    }
}

pub fn rating_key(anime_id: &str, season: u32, episode: usize) -> String {
    format!("{anime_id}-{season}-{episode}")
}

/// Per-episode like/dislike tallies plus this user's own vote.
#[derive(Clone)]
pub struct Ratings {
    store: KvStore,
}

impl Ratings {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn counts(&self, key: &str) -> RatingCounts {
        let all: HashMap<String, RatingCounts> = self.store.read_or_default(EPISODE_RATINGS_KEY);
        all.get(key).copied().unwrap_or_default()
    }

    pub fn user_vote(&self, key: &str) -> Option<Vote> {
        let votes: HashMap<String, Vote> = self.store.read_or_default(USER_EPISODE_RATINGS_KEY);
        votes.get(key).copied()
    }

    /// Repeating the current vote withdraws it; the opposite vote moves it.
    pub fn rate(&self, key: &str, vote: Vote) -> Result<(RatingCounts, Option<Vote>), StoreError> {
        let mut all: HashMap<String, RatingCounts> =
            self.store.read_or_default(EPISODE_RATINGS_KEY);
        let mut votes: HashMap<String, Vote> =
            self.store.read_or_default(USER_EPISODE_RATINGS_KEY);

        let counts = all.entry(key.to_string()).or_default();
        let previous = votes.get(key).copied();
        if let Some(prev) = previous {
            counts.bump(prev, false);
        }
        let current = if previous == Some(vote) {
            votes.remove(key);
            None
        } else {
            counts.bump(vote, true);
            votes.insert(key.to_string(), vote);
            Some(vote)
        };
        let result = *counts;

        self.store.write(EPISODE_RATINGS_KEY, &all)?;
        self.store.write(USER_EPISODE_RATINGS_KEY, &votes)?;
        Ok((result, current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_never_double_counts() {
        let ratings = Ratings::new(KvStore::in_memory());
        let key = rating_key("frieren", 1, 0);

        let (counts, vote) = ratings.rate(&key, Vote::Like).unwrap();
        assert_eq!(counts, RatingCounts { likes: 1, dislikes: 0 });
        assert_eq!(vote, Some(Vote::Like));

        let (counts, _) = ratings.rate(&key, Vote::Dislike).unwrap();
        assert_eq!(counts, RatingCounts { likes: 0, dislikes: 1 });

        let (counts, vote) = ratings.rate(&key, Vote::Dislike).unwrap();
        assert_eq!(counts, RatingCounts::default());
        assert_eq!(vote, None);
        assert_eq!(ratings.user_vote(&key), None);
    }

    #[test]
    fn counts_are_per_episode() {
        let ratings = Ratings::new(KvStore::in_memory());
        ratings.rate("a-1-0", Vote::Like).unwrap();
        assert_eq!(ratings.counts("a-1-1"), RatingCounts::default());
        assert_eq!(ratings.counts("a-1-0").likes, 1);
        assert_eq!(ratings.user_vote("a-1-0"), Some(Vote::Like));
    }
}
