use crate::downloads::DownloadItem;
use crate::types::{NowPlaying, Track};

/// Track list with its own cursor; wraps in both directions.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    tracks: Vec<Track>,
    current: Option<usize>,
}

impl Playlist {
    pub fn new(tracks: Vec<Track>) -> Self {
        let current = if tracks.is_empty() { None } else { Some(0) };
        Self { tracks, current }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.and_then(|idx| self.tracks.get(idx))
    }

    pub fn select(&mut self, idx: usize) -> Option<&Track> {
        if idx >= self.tracks.len() {
            return None;
        }
        self.current = Some(idx);
        self.current()
    }

    pub fn next(&mut self) -> Option<&Track> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        self.current = Some(self.current.map_or(0, |idx| (idx + 1) % len));
        self.current()
    }

    pub fn previous(&mut self) -> Option<&Track> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        self.current = Some(self.current.map_or(0, |idx| (idx + len - 1) % len));
        self.current()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.current().map(|track| NowPlaying {
            title: track.title.clone(),
            subtitle: track.artist.clone().unwrap_or_default(),
            thumbnail: track.thumbnail.clone(),
            source: Some(track.url.clone()),
            position: 0.0,
        })
    }

    pub fn download_items(&self) -> Vec<DownloadItem> {
        self.tracks.iter().map(DownloadItem::music).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(n: u32) -> Track {
        Track {
            title: format!("Track {n}"),
            artist: Some("OST".into()),
            url: format!("https://cdn.example/music/{n}.mp3"),
            thumbnail: None,
        }
    }

    #[test]
    fn cursor_wraps_both_ways() {
        let mut playlist = Playlist::new(vec![track(0), track(1), track(2)]);
        assert_eq!(playlist.current().map(|t| t.title.as_str()), Some("Track 0"));
        assert_eq!(playlist.previous().map(|t| t.title.as_str()), Some("Track 2"));
        assert_eq!(playlist.next().map(|t| t.title.as_str()), Some("Track 0"));
        assert_eq!(playlist.select(1).map(|t| t.title.as_str()), Some("Track 1"));
        assert!(playlist.select(9).is_none());
        assert_eq!(playlist.current_index(), Some(1));
    }

    #[test]
    fn empty_playlist_has_nothing_to_play() {
        let mut playlist = Playlist::default();
        assert!(playlist.next().is_none());
        assert!(playlist.now_playing().is_none());
    }

    #[test]
    fn tracks_become_music_downloads() {
        let playlist = Playlist::new(vec![track(0), track(1)]);
        let items = playlist.download_items();
        assert_eq!(items.len(), 2);
        assert!(items[0].key.starts_with("music-"));
        assert_ne!(items[0].key, items[1].key);
        assert_eq!(
            playlist.now_playing().and_then(|n| n.source),
            Some("https://cdn.example/music/0.mp3".to_string())
        );
    }
}
