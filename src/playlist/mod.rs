//! HLS playlist model, parser and quality selection

pub mod models;
pub mod parser;
pub mod quality;

pub use models::{MasterPlaylist, MediaPlaylist, Playlist, Rendition, RenditionKind, Segment};
pub use parser::parse;
pub use quality::{estimate_video_size, quality_without_size, QualityEntry, QualityMap};

/// Markers the host returns instead of segments when access is denied
const RESTRICTED_MARKERS: [&str; 2] = ["vod_manifest_restricted", "unauthorized_entitlements"];

/// Whether playlist text is an access-denied response
pub fn is_restricted(text: &str) -> bool {
    RESTRICTED_MARKERS.iter().any(|m| text.contains(m))
}
