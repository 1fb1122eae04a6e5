use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command families accepted by the playback engine. Option payloads are
/// routed verbatim; this core never interprets their contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Open,
    Playback,
    Audio,
    Video,
    Subtitle,
    Window,
    Shortcut,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Open => "open",
            CommandKind::Playback => "playback",
            CommandKind::Audio => "audio",
            CommandKind::Video => "video",
            CommandKind::Subtitle => "subtitle",
            CommandKind::Window => "window",
            CommandKind::Shortcut => "shortcut",
        }
    }
}

/// Command interface of the local video engine, implemented outside this
/// crate by the native player wrapper.
pub trait PlaybackEngine: Send + Sync {
    fn command(&self, kind: CommandKind, options: &Value) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Buffering,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: i64,
    pub name: String,
}

/// Live playback telemetry streamed player -> controller via `state_update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Seconds into the current item.
    pub time: f64,
    pub duration: f64,
    pub state: PlaybackState,
    pub volume: f64,
    pub muted: bool,
    #[serde(default)]
    pub audio_tracks: Vec<Track>,
    #[serde(default)]
    pub subtitle_tracks: Vec<Track>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_audio: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subtitle: Option<i64>,
}
