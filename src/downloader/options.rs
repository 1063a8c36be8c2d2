//! Download options
//!
//! `DownloadOptions` is built once, usually from [`DownloaderSettings`] plus
//! command line arguments, and never changes during a run.

use crate::downloader::retry::RetryPolicy;
use crate::downloader::throttle::ThrottleRate;
use crate::downloader::trim::TrimWindow;
use crate::utils::config::DownloaderSettings;
use crate::utils::error::VodError;
use chrono::{DateTime, Utc};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Where the playlist comes from
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistSource {
    /// Fetched over the network; also the base for relative URIs
    Url(Url),
    /// Playlist text obtained by the caller
    Inline { text: String, base_url: Option<Url> },
}

impl PlaylistSource {
    pub fn base_url(&self) -> Option<&Url> {
        match self {
            PlaylistSource::Url(url) => Some(url),
            PlaylistSource::Inline { base_url, .. } => base_url.as_ref(),
        }
    }
}

/// Tags written into the output container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl VideoMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.channel.is_none() && self.created_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOptions {
    pub playlist: PlaylistSource,
    /// Display name or raw rendition name; `None` picks the best quality
    pub quality: Option<String>,
    /// Output file. Without an extension, the container extension of the
    /// selected rendition is appended.
    pub output: PathBuf,
    pub concurrency: usize,
    pub throttle: ThrottleRate,
    pub trim: TrimWindow,
    /// Parent of the per-run scratch directory
    pub temp_dir: PathBuf,
    pub retry: RetryPolicy,
    /// External muxer. `None` concatenates parts without remuxing.
    pub ffmpeg_path: Option<PathBuf>,
    pub metadata: Option<VideoMetadata>,
}

impl DownloadOptions {
    pub fn new(playlist: PlaylistSource, output: impl Into<PathBuf>) -> Self {
        Self {
            playlist,
            quality: None,
            output: output.into(),
            concurrency: 4,
            throttle: ThrottleRate::Unlimited,
            trim: TrimWindow::full(),
            temp_dir: std::env::temp_dir(),
            retry: RetryPolicy::default(),
            ffmpeg_path: None,
            metadata: None,
        }
    }

    /// Options with concurrency, throttle, temp dir and muxer taken from settings
    pub fn from_settings(
        playlist: PlaylistSource,
        output: impl Into<PathBuf>,
        settings: &DownloaderSettings,
    ) -> Self {
        Self {
            concurrency: settings.download_threads,
            throttle: settings.throttle_rate(),
            temp_dir: settings.temp_dir(),
            ffmpeg_path: settings.ffmpeg_path(),
            ..Self::new(playlist, output)
        }
    }

    /// Structural checks that need no network access
    pub fn validate(&self) -> Result<(), VodError> {
        match &self.playlist {
            PlaylistSource::Url(url) => {
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(VodError::validation(format!(
                        "unsupported playlist URL scheme `{}`",
                        url.scheme()
                    )));
                }
            }
            PlaylistSource::Inline { text, .. } => {
                if text.trim().is_empty() {
                    return Err(VodError::validation("playlist content is empty"));
                }
            }
        }

        if let Some(quality) = &self.quality {
            if quality.trim().is_empty() {
                return Err(VodError::validation("quality selector is empty"));
            }
        }

        if self.output.as_os_str().is_empty() {
            return Err(VodError::validation("output path is empty"));
        }
        if self.output.is_dir() {
            return Err(VodError::validation(format!(
                "output path {} is a directory",
                self.output.display()
            )));
        }

        if self.concurrency == 0 {
            return Err(VodError::validation("concurrency must be at least 1"));
        }
        if self.throttle == ThrottleRate::BytesPerSec(0) {
            return Err(VodError::validation("throttle rate must be greater than zero"));
        }

        let TrimWindow { start, end } = self.trim;
        for (label, value) in [("start", start), ("end", end)] {
            if let Some(secs) = value {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(VodError::validation(format!(
                        "trim {} must be a non-negative number of seconds",
                        label
                    )));
                }
            }
        }
        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return Err(VodError::validation(format!(
                    "trim start {}s is not before trim end {}s",
                    start, end
                )));
            }
        }

        if let Some(ffmpeg) = &self.ffmpeg_path {
            resolve_tool(ffmpeg)?;
        }

        Ok(())
    }

    /// Absolute output path
    pub fn output_path(&self) -> Result<PathBuf, VodError> {
        Ok(self.output.absolutize()?.into_owned())
    }
}

/// Locate an external tool given as a path or a bare name on `PATH`
pub fn resolve_tool(tool: &Path) -> Result<PathBuf, VodError> {
    let is_bare_name = tool.components().count() == 1 && !tool.is_absolute();
    if is_bare_name {
        return which::which(tool).map_err(|_| {
            VodError::validation(format!("{} was not found in PATH", tool.display()))
        });
    }
    if tool.is_file() {
        Ok(tool.absolutize()?.into_owned())
    } else {
        Err(VodError::validation(format!(
            "{} does not exist",
            tool.display()
        )))
    }
}
