//! Rendition ordering, display names and size estimates

use crate::playlist::models::{MasterPlaylist, Rendition, RenditionKind};
use crate::utils::format::format_bytes;

impl MasterPlaylist {
    /// Order renditions by descending bandwidth with audio-only renditions
    /// last. Equal bandwidths keep playlist order.
    pub fn sort_by_quality(&mut self) {
        self.renditions
            .sort_by(|a, b| match (a.kind.is_audio(), b.kind.is_audio()) {
                (false, true) => std::cmp::Ordering::Less,
                (true, false) => std::cmp::Ordering::Greater,
                _ => b.bandwidth.cmp(&a.bandwidth),
            });
    }

    /// Display-name lookup table, built once after sorting
    pub fn quality_map(&self) -> QualityMap {
        QualityMap::from_renditions(&self.renditions)
    }
}

/// One selectable quality
#[derive(Debug, Clone, PartialEq)]
pub struct QualityEntry {
    pub display_name: String,
    pub uri: String,
    pub bandwidth: u64,
    pub kind: RenditionKind,
    /// Position of the source rendition in the playlist it came from
    pub rendition: usize,
}

impl QualityEntry {
    pub fn container_extension(&self) -> &'static str {
        if self.kind.is_audio() {
            "m4a"
        } else {
            "mp4"
        }
    }
}

/// Immutable display name -> rendition mapping. Duplicate display names keep
/// the first-seen rendition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityMap {
    entries: Vec<QualityEntry>,
}

impl QualityMap {
    pub fn from_renditions(renditions: &[Rendition]) -> Self {
        let mut entries: Vec<QualityEntry> = Vec::with_capacity(renditions.len());
        for (i, rendition) in renditions.iter().enumerate() {
            let display_name = rendition.display_name();
            if entries.iter().any(|e| e.display_name == display_name) {
                continue;
            }
            entries.push(QualityEntry {
                display_name,
                uri: rendition.uri.clone(),
                bandwidth: rendition.bandwidth,
                kind: rendition.kind,
                rendition: i,
            });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[QualityEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.display_name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry, i.e. the best quality once sorted
    pub fn best(&self) -> Option<&QualityEntry> {
        self.entries.first()
    }

    /// Look up by display name, ignoring case and any size suffix
    pub fn get(&self, name: &str) -> Option<&QualityEntry> {
        let wanted = quality_without_size(name).trim();
        self.entries
            .iter()
            .find(|e| e.display_name.eq_ignore_ascii_case(wanted))
    }

    /// Labels of the form `1080p60 - 2.68GiB` for the given trim window
    pub fn labels_with_size(&self, start: f64, end: f64) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| match estimate_video_size(e.bandwidth, start, end) {
                0 => e.display_name.clone(),
                size => format!("{} - {}", e.display_name, format_bytes(size)),
            })
            .collect()
    }
}

/// Expected output size in bytes for a bandwidth over `[start, end)`
pub fn estimate_video_size(bandwidth: u64, start: f64, end: f64) -> u64 {
    let seconds = (end - start).max(0.0);
    (bandwidth as f64 / 8.0 * seconds) as u64
}

/// Strip a ` - <size>` suffix from a quality label
pub fn quality_without_size(label: &str) -> &str {
    match label.rfind(" - ") {
        Some(idx) => &label[..idx],
        None => label,
    }
}
