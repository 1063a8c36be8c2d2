//! VOD download orchestration
//!
//! [`VodDownloader`] drives one run from playlist to output file:
//! fetch and parse the playlist, pick a rendition, plan the trim window,
//! fetch segments, then concatenate and remux them.

use crate::downloader::fetcher::{resolve_uri, SegmentFetcher};
use crate::downloader::merger::{MuxJob, Muxer};
use crate::downloader::options::{resolve_tool, DownloadOptions, PlaylistSource};
use crate::downloader::progress::{ProgressEvent, ProgressReporter};
use crate::downloader::retry::{retry_with_backoff, AttemptError};
use crate::downloader::state::{DownloadState, StateTracker};
use crate::downloader::throttle::Throttle;
use crate::downloader::transport::Transport;
use crate::downloader::trim;
use crate::playlist::{self, MasterPlaylist, MediaPlaylist, Playlist, QualityMap};
use crate::utils::error::VodError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Rendition chosen for a run
#[derive(Debug, Clone)]
struct Selection {
    name: String,
    extension: &'static str,
    media: MediaPlaylist,
    base_url: Option<Url>,
}

/// Qualities offered by a playlist, for listing before a download
#[derive(Debug, Clone)]
pub struct PlaylistInfo {
    pub qualities: QualityMap,
    /// Length of the video in seconds, when known
    pub duration: Option<f64>,
}

impl PlaylistInfo {
    /// Quality labels with estimated sizes for the given window
    pub fn labels(&self, start: Option<f64>, end: Option<f64>) -> Vec<String> {
        let duration = self.duration.unwrap_or(0.0);
        let start = start.unwrap_or(0.0);
        let end = end.unwrap_or(duration).min(duration);
        self.qualities.labels_with_size(start, end)
    }
}

/// Runs a single VOD download
pub struct VodDownloader {
    options: DownloadOptions,
    transport: Arc<dyn Transport>,
    state: StateTracker,
}

impl VodDownloader {
    pub fn new(options: DownloadOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            transport,
            state: StateTracker::new(),
        }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Watch state changes of this downloader
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> DownloadState {
        self.state.current()
    }

    /// Download the VOD and return the path of the written file.
    ///
    /// The output exists if and only if this returns `Ok`. The scratch
    /// directory is removed on every exit path.
    pub async fn download(
        &self,
        progress_tx: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, VodError> {
        let progress = ProgressReporter::new(progress_tx);

        let result = match self.options.validate() {
            Ok(()) => {
                let scratch = self
                    .options
                    .temp_dir
                    .join(format!("vodloader_{}", Uuid::new_v4().simple()));
                let result = self.run(&scratch, &progress, &cancel).await;
                remove_scratch(&scratch).await;
                result
            }
            Err(e) => Err(e),
        };

        let result = match result {
            Err(_) if cancel.is_cancelled() => Err(VodError::Cancelled),
            other => other,
        };

        match &result {
            Ok(path) => {
                info!("Download finished: {}", path.display());
                self.state.advance(DownloadState::Done(path.clone()));
            }
            Err(VodError::Cancelled) => {
                info!("Download cancelled");
                progress.status("Download cancelled").await;
                self.state.advance(DownloadState::Cancelled);
            }
            Err(e) => {
                error!("Download failed: {}", e);
                self.state.advance(DownloadState::Failed(e.to_string()));
            }
        }
        result
    }

    /// Fetch the playlist and report which qualities it offers
    pub async fn probe(&self, cancel: &CancellationToken) -> Result<PlaylistInfo, VodError> {
        let (text, base_url) = self.load_playlist(cancel).await?;
        match playlist::parse(&text)? {
            Playlist::Master(mut master) => {
                master.sort_by_quality();
                let qualities = master.quality_map();
                let duration = match qualities.best() {
                    Some(best) => {
                        let url = resolve_uri(base_url.as_ref(), &best.uri)?;
                        let media = self.fetch_media(&url, cancel).await?;
                        Some(media_duration(&media))
                    }
                    None => None,
                };
                Ok(PlaylistInfo {
                    qualities,
                    duration,
                })
            }
            Playlist::Media(media) => Ok(PlaylistInfo {
                qualities: QualityMap::default(),
                duration: Some(media_duration(&media)),
            }),
        }
    }

    async fn run(
        &self,
        scratch: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, VodError> {
        self.state.advance(DownloadState::PlaylistFetching);
        progress.begin_stage(1, "Fetching Playlist").await;

        tokio::fs::create_dir_all(scratch).await?;
        debug!("Scratch directory {}", scratch.display());
        let output = self.prepare_output().await?;

        let selection = self.select(cancel).await?;
        progress.percent(100).await;
        let output = with_default_extension(output, selection.extension);

        self.state.advance(DownloadState::RenditionSelected {
            name: selection.name.clone(),
        });
        info!(
            "Selected {} ({} segments, {:.1}s)",
            selection.name,
            selection.media.segments.len(),
            selection.media.duration()
        );

        let plan = trim::plan(&selection.media.segments, self.options.trim)?;
        let segments = &selection.media.segments[plan.retained.clone()];

        self.state
            .advance(DownloadState::SegmentFetching { total: segments.len() });
        progress.begin_stage(2, "Downloading").await;

        let fetcher = SegmentFetcher::new(Arc::clone(&self.transport), scratch)
            .with_concurrency(self.options.concurrency)
            .with_retry(self.options.retry.clone())
            .with_throttle(Throttle::new(self.options.throttle));
        let fetched = fetcher
            .fetch(segments, selection.base_url.as_ref(), progress, cancel)
            .await?;

        self.state.advance(DownloadState::Trimming);
        let planned = segments.iter().map(|s| s.index);
        if !fetched.iter().map(|f| f.index).eq(planned) {
            return Err(VodError::validation(
                "fetched segments do not match the planned segments",
            ));
        }
        let cut = plan.needs_cut().then_some(plan.cut);
        if let Some(cut) = cut {
            debug!(
                "Cutting {:.3}s..{:.3}s of the retained {:.3}s",
                cut.start, cut.end, plan.retained_duration
            );
        }

        if cancel.is_cancelled() {
            return Err(VodError::Cancelled);
        }
        self.state.advance(DownloadState::Muxing);

        let ffmpeg = self
            .options
            .ffmpeg_path
            .as_deref()
            .map(resolve_tool)
            .transpose()?;
        let muxer = Muxer::new(ffmpeg, scratch).with_metadata(self.options.metadata.clone());
        let job = MuxJob {
            parts: fetched.into_iter().map(|f| f.path).collect(),
            output: output.clone(),
            cut,
            duration: plan.retained_duration,
        };
        muxer.mux(&job, progress, cancel).await?;

        Ok(output)
    }

    /// Parse the playlist and resolve the rendition to download
    async fn select(&self, cancel: &CancellationToken) -> Result<Selection, VodError> {
        let (text, base_url) = self.load_playlist(cancel).await?;

        match playlist::parse(&text)? {
            Playlist::Master(mut master) => {
                master.sort_by_quality();
                let (name, uri, extension) =
                    select_rendition(&master, self.options.quality.as_deref())?;
                let url = resolve_uri(base_url.as_ref(), &uri)?;
                let media = self.fetch_media(&url, cancel).await?;
                Ok(Selection {
                    name,
                    extension,
                    media,
                    base_url: Some(url),
                })
            }
            Playlist::Media(media) => {
                if let Some(quality) = &self.options.quality {
                    warn!("Ignoring quality `{}` for a media playlist", quality);
                }
                Ok(Selection {
                    name: "source".to_string(),
                    extension: "mp4",
                    media,
                    base_url,
                })
            }
        }
    }

    async fn load_playlist(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<Url>), VodError> {
        let (text, base_url) = match &self.options.playlist {
            PlaylistSource::Url(url) => (self.fetch_text(url, cancel).await?, Some(url.clone())),
            PlaylistSource::Inline { text, base_url } => (text.clone(), base_url.clone()),
        };
        check_restricted(&text)?;
        Ok((text, base_url))
    }

    async fn fetch_media(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<MediaPlaylist, VodError> {
        let text = self.fetch_text(url, cancel).await?;
        check_restricted(&text)?;
        match playlist::parse(&text)? {
            Playlist::Media(media) => Ok(media),
            Playlist::Master(_) => Err(VodError::validation(format!(
                "{} is a master playlist, expected a media playlist",
                url
            ))),
        }
    }

    async fn fetch_text(&self, url: &Url, cancel: &CancellationToken) -> Result<String, VodError> {
        debug!("Fetching playlist {}", url);
        retry_with_backoff(url.as_str(), &self.options.retry, cancel, |_, _| async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(VodError::Cancelled.into()),
                text = self.transport.get_text(url) => text.map_err(AttemptError::from),
            }
        })
        .await
    }

    /// Absolute output path with its parent directory created
    async fn prepare_output(&self) -> Result<PathBuf, VodError> {
        let output = self.options.output_path()?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VodError::validation(format!(
                    "cannot create output directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(output)
    }
}

/// Pick a rendition by display name or raw name, or the best one
fn select_rendition(
    master: &MasterPlaylist,
    quality: Option<&str>,
) -> Result<(String, String, &'static str), VodError> {
    let qualities = master.quality_map();

    let Some(wanted) = quality else {
        return qualities
            .best()
            .map(|e| (e.display_name.clone(), e.uri.clone(), e.container_extension()))
            .ok_or_else(|| VodError::validation("playlist offers no renditions"));
    };

    if let Some(entry) = qualities.get(wanted) {
        return Ok((
            entry.display_name.clone(),
            entry.uri.clone(),
            entry.container_extension(),
        ));
    }

    let wanted = playlist::quality_without_size(wanted).trim();
    master
        .renditions
        .iter()
        .find(|r| r.name.eq_ignore_ascii_case(wanted))
        .map(|r| (r.display_name(), r.uri.clone(), r.container_extension()))
        .ok_or_else(|| {
            VodError::validation(format!(
                "quality `{}` is not available (available: {})",
                wanted,
                qualities.names().join(", ")
            ))
        })
}

fn check_restricted(text: &str) -> Result<(), VodError> {
    if playlist::is_restricted(text) {
        return Err(VodError::validation(
            "access to this video is restricted, the playlist cannot be downloaded",
        ));
    }
    Ok(())
}

fn media_duration(media: &MediaPlaylist) -> f64 {
    media.total_secs.unwrap_or_else(|| media.duration())
}

fn with_default_extension(output: PathBuf, extension: &str) -> PathBuf {
    if output.extension().is_some() {
        output
    } else {
        output.with_extension(extension)
    }
}

async fn remove_scratch(scratch: &Path) {
    match tokio::fs::remove_dir_all(scratch).await {
        Ok(()) => debug!("Removed scratch directory {}", scratch.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove scratch directory {}: {}",
            scratch.display(),
            e
        ),
    }
}
