use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum AnimeKind {
    #[default]
    Anime,
    Movie,
    Ova,
    Other(String),
}

impl AnimeKind {
    pub fn as_str(&self) -> &str {
        match self {
            AnimeKind::Anime => "anime",
            AnimeKind::Movie => "movie",
            AnimeKind::Ova => "ova",
            AnimeKind::Other(other) => other,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            AnimeKind::Anime => "Anime",
            AnimeKind::Movie => "Movie",
            AnimeKind::Ova => "OVA",
            AnimeKind::Other(other) => other,
        }
    }
}

impl From<String> for AnimeKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "anime" | "tv" | "series" => AnimeKind::Anime,
            "movie" | "film" => AnimeKind::Movie,
            "ova" | "ona" => AnimeKind::Ova,
            _ => AnimeKind::Other(value),
        }
    }
}

impl From<AnimeKind> for String {
    fn from(kind: AnimeKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anime {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: AnimeKind,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub seasons: Vec<Season>,
    #[serde(default)]
    pub music: Vec<Track>,
}

impl Anime {
    pub fn image(&self) -> Option<&str> {
        self.thumbnail.as_deref().or(self.cover.as_deref())
    }

    pub fn season(&self, number: u32) -> Option<&Season> {
        self.seasons.iter().find(|s| s.number == number)
    }

    pub fn episode(&self, season: u32, index: usize) -> Option<&Episode> {
        self.season(season).and_then(|s| s.episodes.get(index))
    }

    pub fn episode_count(&self) -> usize {
        self.seasons.iter().map(|s| s.episodes.len()).sum()
    }

    /// Season numbers in playback order.
    pub fn season_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.seasons.iter().map(|s| s.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Season {
    #[serde(alias = "season", default = "first_season")]
    pub number: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

fn first_season() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningWindow {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoSource {
    Url(String),
    Labeled {
        url: String,
        #[serde(default, alias = "label")]
        quality: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub video_sources: Vec<VideoSource>,
    #[serde(default)]
    pub video_qualities: BTreeMap<String, String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub opening: Option<OpeningWindow>,
}

impl Episode {
    /// Every playable source, best quality first.
    pub fn streams(&self) -> Vec<StreamOption> {
        let mut options = Vec::new();
        if let Some(url) = self.video_url.as_deref().filter(|u| !u.trim().is_empty()) {
            options.push(StreamOption::new(url, None));
        }
        for source in &self.video_sources {
            match source {
                VideoSource::Url(url) => options.push(StreamOption::new(url, None)),
                VideoSource::Labeled { url, quality } => {
                    options.push(StreamOption::new(url, quality.as_deref()))
                }
            }
        }
        for (label, url) in &self.video_qualities {
            options.push(StreamOption::new(url, Some(label)));
        }
        options.dedup_by(|a, b| a.url == b.url);
        options.sort_by(|a, b| b.quality_rank.cmp(&a.quality_rank));
        options
    }

    pub fn primary_source(&self) -> Option<String> {
        self.preferred_source(None)
    }

    /// The stream labelled `quality`, else the best one.
    pub fn preferred_source(&self, quality: Option<&str>) -> Option<String> {
        let mut streams = self.streams();
        let idx = quality
            .and_then(|q| streams.iter().position(|s| s.quality_label == q))
            .unwrap_or(0);
        (idx < streams.len()).then(|| streams.swap_remove(idx).url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOption {
    pub url: String,
    pub quality_label: String,
    pub quality_rank: i32,
    pub is_hls: bool,
}

impl StreamOption {
    fn new(url: &str, quality: Option<&str>) -> Self {
        let quality_label = quality.unwrap_or("auto").to_string();
        let quality_rank = quality
            .and_then(|q| q.trim_end_matches(['p', 'P']).parse::<i32>().ok())
            .unwrap_or(0);
        Self {
            url: url.to_string(),
            quality_label,
            quality_rank,
            is_hls: url.split('?').next().unwrap_or(url).ends_with(".m3u8"),
        }
    }

    pub fn label(&self) -> String {
        let kind = if self.is_hls { "HLS" } else { "MP4" };
        format!("{} ({})", self.quality_label, kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    pub url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// Whatever the shared media element is currently showing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlaying {
    pub title: String,
    pub subtitle: String,
    pub thumbnail: Option<String>,
    pub source: Option<String>,
    pub position: f64,
}

impl NowPlaying {
    pub fn display_title(&self) -> String {
        if self.subtitle.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.title, self.subtitle)
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Int(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_record_with_mixed_sources() {
        let raw = r#"{
            "id": 7,
            "title": "Frieren",
            "type": "Movie",
            "cover": "https://img/frieren.jpg",
            "seasons": [{
                "number": 1,
                "episodes": [{
                    "title": "The Journey's End",
                    "videoSources": ["https://cdn/a.mp4", {"url": "https://cdn/b.mp4", "quality": "1080p"}],
                    "videoQualities": {"720p": "https://cdn/c.mp4"},
                    "opening": {"start": 90, "end": 120}
                }]
            }]
        }"#;
        let anime: Anime = serde_json::from_str(raw).unwrap();
        assert_eq!(anime.id, "7");
        assert_eq!(anime.kind, AnimeKind::Movie);
        assert_eq!(anime.image(), Some("https://img/frieren.jpg"));

        let episode = anime.episode(1, 0).unwrap();
        let streams = episode.streams();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[0].url, "https://cdn/b.mp4");
        assert_eq!(streams[1].quality_label, "720p");
        assert_eq!(
            episode.opening,
            Some(OpeningWindow {
                start: 90.0,
                end: 120.0
            })
        );
    }

    #[test]
    fn preferred_quality_falls_back_to_best() {
        let episode = Episode {
            video_sources: vec![VideoSource::Labeled {
                url: "https://cdn/hd.m3u8".into(),
                quality: Some("1080p".into()),
            }],
            video_qualities: BTreeMap::from([("480p".to_string(), "https://cdn/sd.mp4".to_string())]),
            ..Default::default()
        };
        let labels: Vec<String> = episode.streams().iter().map(StreamOption::label).collect();
        assert_eq!(labels, vec!["1080p (HLS)", "480p (MP4)"]);
        assert_eq!(
            episode.preferred_source(Some("480p")).as_deref(),
            Some("https://cdn/sd.mp4")
        );
        assert_eq!(
            episode.preferred_source(Some("720p")).as_deref(),
            Some("https://cdn/hd.m3u8")
        );
        assert!(Episode::default().preferred_source(Some("480p")).is_none());
    }

    #[test]
    fn unknown_kind_survives() {
        let anime: Anime =
            serde_json::from_str(r#"{"id":"x","title":"T","type":"special"}"#).unwrap();
        assert_eq!(anime.kind, AnimeKind::Other("special".into()));
        assert!(anime.seasons.is_empty());
    }

    #[test]
    fn video_url_is_primary_when_alone() {
        let episode = Episode {
            video_url: Some("https://cdn/ep1.m3u8?token=1".into()),
            ..Default::default()
        };
        let streams = episode.streams();
        assert!(streams[0].is_hls);
        assert_eq!(
            episode.primary_source().as_deref(),
            Some("https://cdn/ep1.m3u8?token=1")
        );
    }
}
