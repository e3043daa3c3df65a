use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::cache::OfflineCache;
use crate::history::{ContinueEntry, PlaybackPosition, WatchHistory};
use crate::profiles::ProfileManager;
use crate::types::{Anime, NowPlaying, OpeningWindow};

pub const PLAYER_ENV_KEY: &str = "ANIVERSE_PLAYER";
pub const SKIP_LEAD_SECONDS: f64 = 5.0;
pub const SAVE_INTERVAL_SECONDS: f64 = 5.0;
pub const WATCHED_THRESHOLD: f64 = 90.0;
/// mpv key bound to the skip control.
pub const SKIP_OPENING_KEY: &str = "s";
const SKIP_OPENING_MESSAGE: &str = "aniverse-skip-opening";

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("{title} has no season {season} episode {episode}")]
    NoEpisode {
        title: String,
        season: u32,
        episode: usize,
    },
    #[error("{0} has no playable source")]
    NoSource(String),
    #[error("Player '{0}' not found. Install mpv or set {PLAYER_ENV_KEY} to a valid command.")]
    PlayerNotFound(String),
    #[error("failed to launch player '{player}'")]
    Launch {
        player: String,
        #[source]
        source: std::io::Error,
    },
    #[error("player control channel failed: {0}")]
    Ipc(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    TimeUpdate { time: f64, duration: Option<f64> },
    /// The viewer pressed the skip control.
    SkipRequested,
    Ended,
}

/// The single media surface episodes are played on.
pub trait MediaElement {
    fn set_source(&mut self, url: &str, title: &str);
    async fn seek(&mut self, time: f64);
    async fn play(&mut self) -> Result<(), PlayerError>;
    /// `None` once the element has stopped without reaching the end.
    async fn next_event(&mut self) -> Option<MediaEvent>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Playing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenedEpisode {
    pub now_playing: NowPlaying,
    pub resumed_at: Option<f64>,
    pub offline: bool,
    pub outcome: PlayOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkipPrompt {
    pub skip_to: f64,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeUpdate {
    pub skip: Option<SkipPrompt>,
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Next { season: u32, episode: usize },
    Finished,
}

/// Skip control state at playback time `time`: shown from five seconds
/// before the opening starts until it ends.
pub fn skip_prompt(opening: Option<OpeningWindow>, time: f64) -> Option<SkipPrompt> {
    let window = opening?;
    if time < window.start - SKIP_LEAD_SECONDS || time > window.end {
        return None;
    }
    Some(SkipPrompt {
        skip_to: window.end,
        remaining: (window.end - time).max(0.0).ceil() as u32,
    })
}

/// Next episode in the season, else the first episode of the next season
/// that has any, else `Finished`.
pub fn next_episode(anime: &Anime, season: u32, episode: usize) -> Advance {
    if anime
        .season(season)
        .is_some_and(|s| episode + 1 < s.episodes.len())
    {
        return Advance::Next {
            season,
            episode: episode + 1,
        };
    }
    anime
        .season_numbers()
        .into_iter()
        .filter(|n| *n > season)
        .find(|n| anime.season(*n).is_some_and(|s| !s.episodes.is_empty()))
        .map_or(Advance::Finished, |next| Advance::Next {
            season: next,
            episode: 0,
        })
}

struct Current {
    anime: Anime,
    season: u32,
    episode: usize,
    duration: Option<f64>,
    opening: Option<OpeningWindow>,
    time: f64,
    last_saved: f64,
    watched: bool,
    skipped_opening: bool,
}

/// Glue between the media element, watch history and profiles.
pub struct PlayerSession<M> {
    element: M,
    history: WatchHistory,
    profiles: ProfileManager,
    offline: Option<OfflineCache>,
    quality: Option<String>,
    current: Option<Current>,
}

impl<M: MediaElement> PlayerSession<M> {
    pub fn new(element: M, history: WatchHistory, profiles: ProfileManager) -> Self {
        Self {
            element,
            history,
            profiles,
            offline: None,
            quality: None,
            current: None,
        }
    }

    /// Prefer cached copies from `cache` over remote sources.
    pub fn with_offline_cache(mut self, cache: OfflineCache) -> Self {
        self.offline = Some(cache);
        self
    }

    /// Stream quality to pick when an episode offers several; the best one is
    /// used when an episode lacks it.
    pub fn with_quality(mut self, quality: Option<String>) -> Self {
        self.quality = quality;
        self
    }

    pub fn element(&self) -> &M {
        &self.element
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.current
            .as_ref()
            .map(|c| episode_now_playing(&c.anime, c.season, c.episode, None))
    }

    pub async fn open_episode(
        &mut self,
        anime: &Anime,
        season: u32,
        episode: usize,
    ) -> Result<OpenedEpisode, PlayerError> {
        let ep = anime
            .episode(season, episode)
            .ok_or_else(|| PlayerError::NoEpisode {
                title: anime.title.clone(),
                season,
                episode,
            })?;
        let remote = ep
            .preferred_source(self.quality.as_deref())
            .ok_or_else(|| PlayerError::NoSource(anime.title.clone()))?;
        let cached = self
            .offline
            .as_ref()
            .and_then(|cache| cache.blob_url(&remote))
            .map(|url| url.to_string());
        let offline = cached.is_some();
        let source = cached.unwrap_or(remote);

        let mut now_playing = episode_now_playing(anime, season, episode, Some(source.clone()));
        self.element.set_source(&source, &now_playing.display_title());

        let resumed_at = self
            .history
            .position(&anime.id)
            .filter(|p| p.season == season && p.episode == episode && p.time > 0.0)
            .map(|p| p.time);
        if let Some(time) = resumed_at {
            self.element.seek(time).await;
            now_playing.position = time;
        }

        self.current = Some(Current {
            anime: anime.clone(),
            season,
            episode,
            duration: ep.duration,
            opening: ep.opening,
            time: resumed_at.unwrap_or(0.0),
            last_saved: resumed_at.unwrap_or(0.0),
            watched: self.history.is_watched(&anime.id, season, episode),
            skipped_opening: false,
        });

        let outcome = match self.element.play().await {
            Ok(()) => PlayOutcome::Playing,
            Err(err) => {
                tracing::warn!(error = %err, source = %source, "playback did not start");
                PlayOutcome::Failed(err.to_string())
            }
        };
        tracing::info!(anime = %anime.id, season, episode, offline, "episode opened");
        Ok(OpenedEpisode {
            now_playing,
            resumed_at,
            offline,
            outcome,
        })
    }

    /// Called for every playback tick.
    pub fn on_time_update(&mut self, time: f64, duration: Option<f64>) -> TimeUpdate {
        let Some(current) = self.current.as_mut() else {
            return TimeUpdate::default();
        };
        current.time = time;
        if duration.is_some() {
            current.duration = duration;
        }
        let progress = current
            .duration
            .filter(|d| *d > 0.0)
            .map(|d| (time / d * 100.0).clamp(0.0, 100.0));
        let update = TimeUpdate {
            skip: skip_prompt(current.opening, time),
            progress,
        };

        if (time - current.last_saved).abs() >= SAVE_INTERVAL_SECONDS {
            current.last_saved = time;
            let anime_id = current.anime.id.clone();
            let position = PlaybackPosition {
                season: current.season,
                episode: current.episode,
                time,
            };
            let entry = ContinueEntry {
                anime_id: anime_id.clone(),
                title: current.anime.title.clone(),
                thumbnail: current.anime.image().map(str::to_string),
                season: current.season,
                episode: current.episode,
                progress: progress.unwrap_or(0.0),
                updated_at: Utc::now().timestamp_millis(),
            };
            if let Err(err) = self.history.save_position(&anime_id, position) {
                tracing::warn!(error = %err, "failed to save playback position");
            }
            self.record_progress(entry);
        }

        if let Some(current) = self.current.as_mut()
            && !current.watched
            && progress.is_some_and(|p| p >= WATCHED_THRESHOLD)
        {
            current.watched = true;
            if let Err(err) =
                self.history
                    .mark_watched(&current.anime.id, current.season, current.episode)
            {
                tracing::warn!(error = %err, "failed to mark episode watched");
            }
        }
        update
    }

    fn record_progress(&self, entry: ContinueEntry) {
        let result = match self.profiles.active_profile_id() {
            Some(profile_id) => self
                .profiles
                .update_continue_watching(&profile_id, entry)
                .map(|_| ()),
            None => self.history.update_continue_watching(entry),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to update continue watching");
        }
    }

    /// Seeks past the opening if the skip control is showing at the last
    /// reported time; otherwise does nothing.
    pub async fn skip_opening(&mut self) -> Option<f64> {
        let current = self.current.as_mut()?;
        let prompt = skip_prompt(current.opening, current.time)?;
        current.skipped_opening = true;
        current.time = prompt.skip_to;
        self.element.seek(prompt.skip_to).await;
        Some(prompt.skip_to)
    }

    pub async fn on_ended(&mut self) -> Result<Advance, PlayerError> {
        let Some(current) = self.current.as_ref() else {
            return Ok(Advance::Finished);
        };
        if let Err(err) = self
            .history
            .mark_watched(&current.anime.id, current.season, current.episode)
        {
            tracing::warn!(error = %err, "failed to mark episode watched");
        }
        let advance = next_episode(&current.anime, current.season, current.episode);
        match advance {
            Advance::Next { season, episode } => {
                let anime = current.anime.clone();
                self.open_episode(&anime, season, episode).await?;
            }
            Advance::Finished => {
                tracing::info!(anime = %current.anime.id, "reached the final episode");
                self.current = None;
            }
        }
        Ok(advance)
    }

    /// Drive the element until playback stops or the last episode ends.
    /// With `auto_skip` each opening is skipped once without waiting for the
    /// skip control to be pressed.
    pub async fn run(&mut self, auto_skip: bool) -> Result<(), PlayerError> {
        while let Some(event) = self.element.next_event().await {
            match event {
                MediaEvent::TimeUpdate { time, duration } => {
                    let update = self.on_time_update(time, duration);
                    let pending = self.current.as_ref().is_some_and(|c| !c.skipped_opening);
                    if auto_skip && pending && update.skip.is_some() {
                        self.skip_opening().await;
                    }
                }
                MediaEvent::SkipRequested => {
                    if self.skip_opening().await.is_none() {
                        tracing::debug!("skip pressed outside an opening");
                    }
                }
                MediaEvent::Ended => {
                    if self.on_ended().await? == Advance::Finished {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn episode_now_playing(
    anime: &Anime,
    season: u32,
    episode: usize,
    source: Option<String>,
) -> NowPlaying {
    let ep_title = anime
        .episode(season, episode)
        .map(|e| e.title.clone())
        .filter(|t| !t.is_empty());
    let subtitle = match ep_title {
        Some(title) => format!("Season {season} \u{00b7} Episode {} \u{00b7} {title}", episode + 1),
        None => format!("Season {season} \u{00b7} Episode {}", episode + 1),
    };
    NowPlaying {
        title: anime.title.clone(),
        subtitle,
        thumbnail: anime.image().map(str::to_string),
        source,
        position: 0.0,
    }
}

pub fn detect_player() -> String {
    std::env::var(PLAYER_ENV_KEY)
        .ok()
        .filter(|val| !val.trim().is_empty())
        .unwrap_or_else(|| "mpv".to_string())
}

/// mpv driven over its JSON IPC socket.
pub struct MpvElement {
    command: Vec<String>,
    source: Option<String>,
    title: String,
    start: Option<f64>,
    duration: Option<f64>,
    child: Option<Child>,
    ipc: Option<MpvIpc>,
}

impl MpvElement {
    /// `command` is the player program followed by any extra arguments.
    pub fn new(command: Vec<String>) -> Self {
        let command = if command.is_empty() {
            vec![detect_player()]
        } else {
            command
        };
        Self {
            command,
            source: None,
            title: String::new(),
            start: None,
            duration: None,
            child: None,
            ipc: None,
        }
    }

    fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "aniverse-mpv-{}-{:08x}.sock",
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    async fn reap(&mut self) {
        self.ipc = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.wait().await {
                tracing::debug!(error = %err, "failed to reap player process");
            }
        }
    }
}

impl MediaElement for MpvElement {
    fn set_source(&mut self, url: &str, title: &str) {
        self.source = Some(url.to_string());
        self.title = title.to_string();
        self.start = None;
        self.duration = None;
    }

    async fn seek(&mut self, time: f64) {
        match self.ipc.as_mut() {
            Some(ipc) => {
                let command = serde_json::json!(["seek", time, "absolute"]);
                if let Err(err) = ipc.send(command).await {
                    tracing::warn!(error = %err, "seek command failed");
                }
            }
            None => self.start = Some(time),
        }
    }

    async fn play(&mut self) -> Result<(), PlayerError> {
        self.reap().await;
        let source = self
            .source
            .clone()
            .ok_or_else(|| PlayerError::NoSource(self.title.clone()))?;
        let player = self.command[0].clone();
        let socket = Self::socket_path();

        let mut cmd = Command::new(&player);
        cmd.args(&self.command[1..]);
        cmd.arg("--quiet");
        cmd.arg("--terminal=no");
        cmd.arg(format!("--force-media-title={}", self.title));
        cmd.arg(format!("--input-ipc-server={}", socket.display()));
        if let Some(start) = self.start.take() {
            cmd.arg(format!("--start={start:.3}"));
        }
        cmd.arg(&source);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PlayerError::PlayerNotFound(player.clone())
            } else {
                PlayerError::Launch {
                    player: player.clone(),
                    source: err,
                }
            }
        })?;
        self.child = Some(child);

        match MpvIpc::connect(&socket).await {
            Ok(mut ipc) => {
                for (id, property) in [(1, "time-pos"), (2, "duration")] {
                    let observe = serde_json::json!(["observe_property", id, property]);
                    ipc.send(observe)
                        .await
                        .map_err(|err| PlayerError::Ipc(err.to_string()))?;
                }
                let bind = serde_json::json!([
                    "keybind",
                    SKIP_OPENING_KEY,
                    format!("script-message {SKIP_OPENING_MESSAGE}")
                ]);
                if let Err(err) = ipc.send(bind).await {
                    tracing::warn!(error = %err, "failed to bind the skip key");
                }
                self.ipc = Some(ipc);
            }
            Err(err) => {
                tracing::warn!(error = %err, "playing without progress tracking");
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<MediaEvent> {
        loop {
            let line = match self.ipc.as_mut() {
                Some(ipc) => ipc.next_line().await,
                None => None,
            };
            let Some(line) = line else {
                self.reap().await;
                return None;
            };
            let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            match message.get("event").and_then(|e| e.as_str()) {
                Some("property-change") => {
                    let value = message.get("data").and_then(|d| d.as_f64());
                    match message.get("name").and_then(|n| n.as_str()) {
                        Some("duration") => self.duration = value,
                        Some("time-pos") => {
                            if let Some(time) = value {
                                return Some(MediaEvent::TimeUpdate {
                                    time,
                                    duration: self.duration,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Some("client-message") => {
                    let skip = message
                        .get("args")
                        .and_then(|a| a.get(0))
                        .and_then(|a| a.as_str())
                        == Some(SKIP_OPENING_MESSAGE);
                    if skip {
                        return Some(MediaEvent::SkipRequested);
                    }
                }
                Some("end-file") => {
                    let eof = message.get("reason").and_then(|r| r.as_str()) == Some("eof");
                    self.reap().await;
                    return eof.then_some(MediaEvent::Ended);
                }
                _ => {}
            }
        }
    }
}

#[cfg(unix)]
struct MpvIpc {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

#[cfg(unix)]
impl MpvIpc {
    async fn connect(path: &std::path::Path) -> std::io::Result<Self> {
        use tokio::io::AsyncBufReadExt;

        let mut attempts = 0;
        loop {
            match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => {
                    let (read, writer) = stream.into_split();
                    return Ok(Self {
                        lines: tokio::io::BufReader::new(read).lines(),
                        writer,
                    });
                }
                Err(err) if attempts >= 50 => return Err(err),
                Err(_) => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn send(&mut self, command: serde_json::Value) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::json!({ "command": command }).to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await
    }

    async fn next_line(&mut self) -> Option<String> {
        self.lines.next_line().await.ok().flatten()
    }
}

#[cfg(not(unix))]
struct MpvIpc;

#[cfg(not(unix))]
impl MpvIpc {
    async fn connect(_path: &std::path::Path) -> std::io::Result<Self> {
        tokio::time::sleep(Duration::from_millis(0)).await;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "mpv IPC needs a unix socket",
        ))
    }

    async fn send(&mut self, _command: serde_json::Value) -> std::io::Result<()> {
        Ok(())
    }

    async fn next_line(&mut self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvStore;
    use crate::profiles::NewProfile;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeElement {
        sources: Vec<String>,
        seeks: Vec<f64>,
        events: VecDeque<MediaEvent>,
        fail_play: bool,
    }

    impl MediaElement for FakeElement {
        fn set_source(&mut self, url: &str, _title: &str) {
            self.sources.push(url.to_string());
        }

        async fn seek(&mut self, time: f64) {
            self.seeks.push(time);
        }

        async fn play(&mut self) -> Result<(), PlayerError> {
            if self.fail_play {
                Err(PlayerError::PlayerNotFound("fake".into()))
            } else {
                Ok(())
            }
        }

        async fn next_event(&mut self) -> Option<MediaEvent> {
            self.events.pop_front()
        }
    }

    fn anime() -> Anime {
        serde_json::from_str(
            r#"{
                "id": "frieren",
                "title": "Frieren",
                "seasons": [
                    {"number": 1, "episodes": [
                        {"title": "One", "videoUrl": "https://cdn.example/s1e1.mp4", "duration": 1400,
                         "opening": {"start": 90, "end": 120}},
                        {"title": "Two", "videoUrl": "https://cdn.example/s1e2.mp4", "duration": 1400}
                    ]},
                    {"number": 2, "episodes": [
                        {"title": "Three", "videoUrl": "https://cdn.example/s2e1.mp4"}
                    ]}
                ]
            }"#,
        )
        .unwrap()
    }

    fn session(element: FakeElement, store: &KvStore) -> PlayerSession<FakeElement> {
        PlayerSession::new(
            element,
            WatchHistory::new(store.clone()),
            ProfileManager::new(store.clone()),
        )
    }

    #[test]
    fn skip_control_visibility_window() {
        let opening = Some(OpeningWindow {
            start: 90.0,
            end: 120.0,
        });
        assert!(skip_prompt(opening, 80.0).is_none());
        assert_eq!(
            skip_prompt(opening, 86.0),
            Some(SkipPrompt {
                skip_to: 120.0,
                remaining: 34
            })
        );
        assert_eq!(skip_prompt(opening, 119.0).map(|s| s.remaining), Some(1));
        assert!(skip_prompt(opening, 121.0).is_none());
        assert!(skip_prompt(None, 100.0).is_none());
    }

    #[test]
    fn advance_crosses_seasons_and_stops_at_the_end() {
        let anime = anime();
        assert_eq!(
            next_episode(&anime, 1, 0),
            Advance::Next {
                season: 1,
                episode: 1
            }
        );
        assert_eq!(
            next_episode(&anime, 1, 1),
            Advance::Next {
                season: 2,
                episode: 0
            }
        );
        assert_eq!(next_episode(&anime, 2, 0), Advance::Finished);
    }

    #[tokio::test]
    async fn open_restores_position_for_same_episode_only() {
        let store = KvStore::in_memory();
        WatchHistory::new(store.clone())
            .save_position(
                "frieren",
                PlaybackPosition {
                    season: 1,
                    episode: 1,
                    time: 300.0,
                },
            )
            .unwrap();
        let mut player = session(FakeElement::default(), &store);

        let opened = player.open_episode(&anime(), 1, 1).await.unwrap();
        assert_eq!(opened.resumed_at, Some(300.0));
        assert_eq!(opened.now_playing.position, 300.0);
        assert_eq!(opened.outcome, PlayOutcome::Playing);
        assert_eq!(player.element().seeks, vec![300.0]);

        let opened = player.open_episode(&anime(), 1, 0).await.unwrap();
        assert_eq!(opened.resumed_at, None);
        assert_eq!(
            opened.now_playing.subtitle,
            "Season 1 \u{00b7} Episode 1 \u{00b7} One"
        );
    }

    #[tokio::test]
    async fn play_failure_is_an_outcome_not_an_error() {
        let store = KvStore::in_memory();
        let mut player = session(
            FakeElement {
                fail_play: true,
                ..Default::default()
            },
            &store,
        );
        let opened = player.open_episode(&anime(), 1, 0).await.unwrap();
        assert!(matches!(opened.outcome, PlayOutcome::Failed(_)));

        assert!(matches!(
            player.open_episode(&anime(), 3, 0).await,
            Err(PlayerError::NoEpisode { .. })
        ));
    }

    #[tokio::test]
    async fn prefers_offline_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OfflineCache::open(dir.path(), "offline");
        cache.put("https://cdn.example/s1e1.mp4", b"bytes", None).unwrap();

        let store = KvStore::in_memory();
        let mut player = session(FakeElement::default(), &store).with_offline_cache(cache);
        let opened = player.open_episode(&anime(), 1, 0).await.unwrap();
        assert!(opened.offline);
        assert!(player.element().sources[0].starts_with("file://"));
    }

    #[tokio::test]
    async fn progress_goes_to_active_profile_or_global_history() {
        let store = KvStore::in_memory();
        let mut player = session(FakeElement::default(), &store);
        player.open_episode(&anime(), 1, 0).await.unwrap();

        player.on_time_update(2.0, None);
        assert!(WatchHistory::new(store.clone()).continue_watching().is_empty());

        let update = player.on_time_update(700.0, None);
        assert_eq!(update.progress, Some(50.0));
        let global = WatchHistory::new(store.clone()).continue_watching();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].progress, 50.0);

        let profiles = ProfileManager::new(store.clone());
        let me = profiles
            .create_profile(NewProfile {
                name: "Me".into(),
                ..Default::default()
            })
            .unwrap();
        profiles.set_active_profile(&me.id).unwrap();

        player.on_time_update(1300.0, None);
        let mine = profiles.get_profile(&me.id).unwrap().continue_watching;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].anime_id, "frieren");
        assert!(WatchHistory::new(store.clone()).is_watched("frieren", 1, 0));
        assert_eq!(
            WatchHistory::new(store).position("frieren").map(|p| p.time),
            Some(1300.0)
        );
    }

    #[tokio::test]
    async fn run_skips_opening_and_advances_to_the_end() {
        let store = KvStore::in_memory();
        let element = FakeElement {
            events: VecDeque::from(vec![
                MediaEvent::TimeUpdate {
                    time: 86.0,
                    duration: None,
                },
                MediaEvent::TimeUpdate {
                    time: 87.0,
                    duration: None,
                },
                MediaEvent::Ended,
                MediaEvent::Ended,
                MediaEvent::Ended,
                MediaEvent::TimeUpdate {
                    time: 1.0,
                    duration: None,
                },
            ]),
            ..Default::default()
        };
        let mut player = session(element, &store);
        player.open_episode(&anime(), 1, 0).await.unwrap();
        player.run(true).await.unwrap();

        assert_eq!(player.element().seeks, vec![120.0]);
        assert_eq!(
            player.element().sources,
            vec![
                "https://cdn.example/s1e1.mp4",
                "https://cdn.example/s1e2.mp4",
                "https://cdn.example/s2e1.mp4",
            ]
        );
        assert_eq!(player.element().events.len(), 1);
        assert!(player.now_playing().is_none());
        let history = WatchHistory::new(store);
        assert!(history.is_watched("frieren", 2, 0));
    }

    #[tokio::test]
    async fn skip_key_only_works_while_the_control_is_showing() {
        let store = KvStore::in_memory();
        let element = FakeElement {
            events: VecDeque::from(vec![
                MediaEvent::TimeUpdate {
                    time: 30.0,
                    duration: None,
                },
                MediaEvent::SkipRequested,
                MediaEvent::TimeUpdate {
                    time: 95.0,
                    duration: None,
                },
                MediaEvent::SkipRequested,
            ]),
            ..Default::default()
        };
        let mut player = session(element, &store);
        player.open_episode(&anime(), 1, 0).await.unwrap();
        assert_eq!(player.skip_opening().await, None);

        player.run(false).await.unwrap();
        assert_eq!(player.element().seeks, vec![120.0]);
    }

    #[tokio::test]
    async fn chosen_quality_carries_to_the_next_episode() {
        let anime: Anime = serde_json::from_str(
            r#"{
                "id": "dandadan",
                "title": "Dandadan",
                "seasons": [{"number": 1, "episodes": [
                    {"videoQualities": {"1080p": "https://cdn.example/1-hd.mp4", "480p": "https://cdn.example/1-sd.mp4"}},
                    {"videoQualities": {"1080p": "https://cdn.example/2-hd.mp4", "480p": "https://cdn.example/2-sd.mp4"}}
                ]}]
            }"#,
        )
        .unwrap();
        let store = KvStore::in_memory();
        let element = FakeElement {
            events: VecDeque::from(vec![MediaEvent::Ended, MediaEvent::Ended]),
            ..Default::default()
        };
        let mut player = session(element, &store).with_quality(Some("480p".into()));
        player.open_episode(&anime, 1, 0).await.unwrap();
        player.run(false).await.unwrap();
        assert_eq!(
            player.element().sources,
            vec!["https://cdn.example/1-sd.mp4", "https://cdn.example/2-sd.mp4"]
        );
    }
}
