use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};
use thiserror::Error;

use crate::cache::sanitize_cache_segment;
use crate::store::{CLIPS_META_KEY, KvStore, StoreError};
use crate::types::NowPlaying;

pub const MAX_CLIP_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("nothing is playing right now")]
    NoMedia,
    #[error("the current media has no playable source")]
    NoSource,
    #[error("clip capture is not supported on this system")]
    NoCaptureMechanism,
    #[error("screen capture permission was denied")]
    PermissionDenied,
    #[error("a clip is already being recorded")]
    AlreadyRecording,
    #[error("no clip is being recorded")]
    NotRecording,
    #[error("no clip with id {0}")]
    UnknownClip(String),
    #[error("clip {0} was recorded in an earlier session; record it again to save it")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("failed to write clip file")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A running capture.
pub trait CaptureSession: Send {
    fn mime_type(&self) -> &str;
    /// Stop capturing and hand back the data chunks produced so far.
    fn finish(self: Box<Self>) -> Result<Vec<Vec<u8>>, ClipError>;
}

/// Capture mechanisms. `None` means the mechanism does not exist here, as
/// opposed to existing and failing.
pub trait CaptureBackend {
    fn capture_stream(&self, media: &NowPlaying) -> Option<Result<Box<dyn CaptureSession>, ClipError>>;

    fn capture_display(&self) -> Option<Result<Box<dyn CaptureSession>, ClipError>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub duration: f64,
    pub created_at: i64,
    pub filename: String,
    #[serde(default)]
    pub mime_type: String,
}

struct Recording {
    session: Box<dyn CaptureSession>,
    media: NowPlaying,
    started_at: DateTime<Utc>,
}

/// Clip metadata lives in the store; clip bytes live only in this
/// recorder's memory and vanish with it.
pub struct ClipRecorder<B> {
    store: KvStore,
    backend: B,
    recording: Option<Recording>,
    runtime_clips: HashMap<String, Vec<u8>>,
}

impl<B: CaptureBackend> ClipRecorder<B> {
    pub fn new(store: KvStore, backend: B) -> Self {
        Self {
            store,
            backend,
            recording: None,
            runtime_clips: HashMap::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn start_recording(
        &mut self,
        media: Option<&NowPlaying>,
        now: DateTime<Utc>,
    ) -> Result<(), ClipError> {
        if self.recording.is_some() {
            return Err(ClipError::AlreadyRecording);
        }
        let media = media.ok_or(ClipError::NoMedia)?;
        if media.source.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(ClipError::NoSource);
        }

        let session = match self.backend.capture_stream(media) {
            Some(attempt) => attempt?,
            None => {
                tracing::debug!("direct capture unavailable, asking for display capture");
                self.backend
                    .capture_display()
                    .ok_or(ClipError::NoCaptureMechanism)??
            }
        };
        tracing::info!(title = %media.title, "clip recording started");
        self.recording = Some(Recording {
            session,
            media: media.clone(),
            started_at: now,
        });
        Ok(())
    }

    /// Stops once the recording reaches the length ceiling.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Option<Clip>, ClipError> {
        let expired = self
            .recording
            .as_ref()
            .is_some_and(|rec| (now - rec.started_at).num_seconds() >= MAX_CLIP_SECONDS);
        if expired {
            self.stop_recording(now)
        } else {
            Ok(None)
        }
    }

    /// `Ok(None)` when the capture produced no data.
    pub fn stop_recording(&mut self, now: DateTime<Utc>) -> Result<Option<Clip>, ClipError> {
        let recording = self.recording.take().ok_or(ClipError::NotRecording)?;
        let mime_type = recording.session.mime_type().to_string();
        let chunks = recording.session.finish()?;
        let bytes: Vec<u8> = chunks.concat();
        if bytes.is_empty() {
            tracing::info!("clip discarded: no data captured");
            return Ok(None);
        }

        let elapsed_ms = (now - recording.started_at)
            .num_milliseconds()
            .clamp(0, MAX_CLIP_SECONDS * 1000);
        let stamp = now.timestamp_millis();
        let id = format!("clip-{stamp}-{:08x}", rand::random::<u32>());
        let clip = Clip {
            filename: format!(
                "aniverse-{}-{stamp}.{}",
                sanitize_cache_segment(&recording.media.title),
                extension_for(&mime_type)
            ),
            id,
            title: recording.media.title,
            subtitle: recording.media.subtitle,
            thumbnail: recording.media.thumbnail,
            duration: elapsed_ms as f64 / 1000.0,
            created_at: stamp,
            mime_type,
        };

        let mut clips = self.list_clips();
        clips.push(clip.clone());
        self.store.write(CLIPS_META_KEY, &clips)?;
        self.runtime_clips.insert(clip.id.clone(), bytes);
        tracing::info!(id = %clip.id, duration = clip.duration, "clip saved");
        Ok(Some(clip))
    }

    pub fn list_clips(&self) -> Vec<Clip> {
        self.store.read_or_default(CLIPS_META_KEY)
    }

    pub fn clip_available(&self, id: &str) -> bool {
        self.runtime_clips.contains_key(id)
    }

    /// Writes the clip bytes to `dir` under the clip's filename.
    pub fn save_clip(&self, id: &str, dir: &Path) -> Result<PathBuf, ClipError> {
        let clip = self
            .list_clips()
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ClipError::UnknownClip(id.to_string()))?;
        let bytes = self
            .runtime_clips
            .get(id)
            .ok_or_else(|| ClipError::Unavailable(id.to_string()))?;
        fs::create_dir_all(dir)?;
        let path = dir.join(&clip.filename);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn remove_clip(&mut self, id: &str) -> Result<bool, ClipError> {
        self.runtime_clips.remove(id);
        let mut clips = self.list_clips();
        let before = clips.len();
        clips.retain(|c| c.id != id);
        if clips.len() == before {
            return Ok(false);
        }
        self.store.write(CLIPS_META_KEY, &clips)?;
        Ok(true)
    }

    pub fn clear_clips(&mut self) -> Result<usize, ClipError> {
        self.runtime_clips.clear();
        let count = self.list_clips().len();
        self.store.write(CLIPS_META_KEY, &Vec::<Clip>::new())?;
        Ok(count)
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        _ => "webm",
    }
}

/// Captures straight from the media source with ffmpeg, starting at the
/// current playback position.
pub struct FfmpegCapture {
    program: String,
    work_dir: PathBuf,
}

impl FfmpegCapture {
    pub fn new(program: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            work_dir: work_dir.into(),
        }
    }
}

impl CaptureBackend for FfmpegCapture {
    fn capture_stream(&self, media: &NowPlaying) -> Option<Result<Box<dyn CaptureSession>, ClipError>> {
        let source = media.source.as_deref()?;
        if let Err(err) = fs::create_dir_all(&self.work_dir) {
            return Some(Err(ClipError::Io(err)));
        }
        let output = self.work_dir.join(format!(
            "capture-{}-{:08x}.mkv",
            Utc::now().timestamp_millis(),
            rand::random::<u32>()
        ));
        let spawned = Command::new(&self.program)
            .arg("-hide_banner")
            .args(["-loglevel", "error", "-y"])
            .arg("-ss")
            .arg(format!("{:.3}", media.position.max(0.0)))
            .arg("-i")
            .arg(source)
            .arg("-t")
            .arg(MAX_CLIP_SECONDS.to_string())
            .args(["-c", "copy", "-f", "matroska"])
            .arg(&output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => Some(Ok(Box::new(FfmpegSession { child, output }))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(program = %self.program, "ffmpeg not found");
                None
            }
            Err(err) => Some(Err(ClipError::Capture(err.to_string()))),
        }
    }
}

struct FfmpegSession {
    child: Child,
    output: PathBuf,
}

impl CaptureSession for FfmpegSession {
    fn mime_type(&self) -> &str {
        "video/x-matroska"
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<Vec<u8>>, ClipError> {
        // ffmpeg finalizes the container when told to quit on stdin.
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.write_all(b"q");
        }
        self.child
            .wait()
            .map_err(|err| ClipError::Capture(err.to_string()))?;
        let bytes = match fs::read(&self.output) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(ClipError::Io(err)),
        };
        let _ = fs::remove_file(&self.output);
        Ok(if bytes.is_empty() { Vec::new() } else { vec![bytes] })
    }
}
