//! Playlist data model

use serde::{Deserialize, Serialize};

/// Whether a rendition carries video or only audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenditionKind {
    Video,
    AudioOnly,
}

impl RenditionKind {
    /// Upstream playlists only mark audio renditions through their naming,
    /// so this is decided from the name or group id.
    pub fn from_label(label: &str) -> Self {
        if label.to_ascii_lowercase().contains("audio") {
            RenditionKind::AudioOnly
        } else {
            RenditionKind::Video
        }
    }

    pub fn is_audio(self) -> bool {
        self == RenditionKind::AudioOnly
    }
}

/// One quality variant of a video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendition {
    pub name: String,
    pub kind: RenditionKind,
    /// Bits per second
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<f64>,
    pub codecs: Option<String>,
    /// Media playlist URI, usually relative to the master playlist
    pub uri: String,
}

impl Rendition {
    /// Name shown to users: `1080p60`, `720p`, or `Audio Only`
    pub fn display_name(&self) -> String {
        if self.kind.is_audio() {
            return "Audio Only".to_string();
        }
        match (self.resolution, self.frame_rate) {
            (Some((_, height)), Some(fps)) => format!("{}p{}", height, fps.round() as u32),
            (Some((_, height)), None) => format!("{}p", height),
            _ => self.name.clone(),
        }
    }

    /// Container used for the final output
    pub fn container_extension(&self) -> &'static str {
        if self.kind.is_audio() {
            "m4a"
        } else {
            "mp4"
        }
    }
}

/// One chunk of media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Sequence number, unique within a rendition
    pub index: u64,
    /// Seconds, from `#EXTINF`
    pub duration: f64,
    pub uri: String,
    /// Unknown until fetched
    pub byte_len: Option<u64>,
}

/// A master playlist listing renditions
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MasterPlaylist {
    pub renditions: Vec<Rendition>,
}

/// A media playlist listing segments of one rendition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    pub end_list: bool,
    /// `#EXT-X-TWITCH-TOTAL-SECS`
    pub total_secs: Option<f64>,
}

impl MediaPlaylist {
    /// Sum of segment durations
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// Result of parsing playlist text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}
