//! Downloader configuration

use crate::downloader::throttle::ThrottleRate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default output file name template
pub const DEFAULT_FILENAME_TEMPLATE: &str = "[{date_custom=\"M-d-yy\"}] {channel} - {title}";

/// Persistent downloader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    /// Parallel segment downloads
    pub download_threads: usize,

    /// Cap the download rate at `max_download_speed_kib`
    pub throttle_downloads: bool,

    /// Rate cap in KiB/s
    pub max_download_speed_kib: u64,

    /// Parent of the scratch directories; system temp dir when unset
    pub temp_data_directory: Option<PathBuf>,

    /// Muxer location; searched on PATH when unset
    pub ffmpeg_path: Option<PathBuf>,

    /// Output file name template
    pub filename_template: String,

    /// Print full error chains
    pub verbose_errors: bool,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            download_threads: 4,
            throttle_downloads: true,
            max_download_speed_kib: 4096,
            temp_data_directory: None,
            ffmpeg_path: None,
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            verbose_errors: false,
        }
    }
}

impl DownloaderSettings {
    /// `<config dir>/vodloader/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vodloader").join("settings.json"))
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or unreadable
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Ignoring invalid settings file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                debug!("No settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn throttle_rate(&self) -> ThrottleRate {
        if self.throttle_downloads {
            ThrottleRate::BytesPerSec(self.max_download_speed_kib.saturating_mul(1024))
        } else {
            ThrottleRate::Unlimited
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_data_directory
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Configured muxer, or `ffmpeg` from PATH when installed
    pub fn ffmpeg_path(&self) -> Option<PathBuf> {
        self.ffmpeg_path
            .clone()
            .or_else(|| which::which("ffmpeg").ok())
    }
}
