//! Concurrent segment fetching
//!
//! Segments are downloaded by a bounded pool of workers into a scratch
//! directory, one file per segment named after its sequence index. All
//! workers share a single [`Throttle`], and each segment is retried on its
//! own according to the [`RetryPolicy`].

use crate::downloader::merger::cleanup_segments;
use crate::downloader::progress::{ProgressReporter, TransferStats};
use crate::downloader::retry::{retry_with_backoff, AttemptError, RetryPolicy};
use crate::downloader::throttle::Throttle;
use crate::downloader::transport::Transport;
use crate::playlist::Segment;
use crate::utils::error::{TransportError, VodError};
use crate::utils::format::{format_bytes, format_rate};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// MPEG-TS packet size
const TS_PACKET_LEN: u64 = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// A segment written to the scratch directory
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSegment {
    pub index: u64,
    pub path: PathBuf,
    pub bytes: u64,
}

/// One unit of work for the pool
#[derive(Debug, Clone)]
struct FetchJob {
    index: u64,
    url: Url,
    path: PathBuf,
}

/// Downloads segments with bounded concurrency
pub struct SegmentFetcher {
    transport: Arc<dyn Transport>,
    scratch_dir: PathBuf,
    concurrency: usize,
    retry: RetryPolicy,
    throttle: Throttle,
}

impl SegmentFetcher {
    pub fn new(transport: Arc<dyn Transport>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            scratch_dir: scratch_dir.into(),
            concurrency: 4,
            retry: RetryPolicy::default(),
            throttle: Throttle::unlimited(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Fetch every segment and return them in index order.
    ///
    /// Relative segment URIs are resolved against `base_url`. On failure or
    /// cancellation, any files already written are removed before returning.
    pub async fn fetch(
        &self,
        segments: &[Segment],
        base_url: Option<&Url>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<FetchedSegment>, VodError> {
        if cancel.is_cancelled() {
            return Err(VodError::Cancelled);
        }

        let jobs = segments
            .iter()
            .map(|segment| self.job_for(segment, base_url))
            .collect::<Result<Vec<_>, _>>()?;

        if jobs.is_empty() {
            progress.stage_percent(2, "Downloading", 100).await;
            return Ok(Vec::new());
        }

        info!(
            "Fetching {} segments with {} workers",
            jobs.len(),
            self.concurrency
        );

        let paths: Vec<PathBuf> = jobs.iter().map(|job| job.path.clone()).collect();
        let mut stats = TransferStats::new(jobs.len());
        let mut fetched = Vec::with_capacity(jobs.len());
        let mut failure = None;

        {
            let tasks = stream::iter(jobs)
                .map(|job| async move {
                    let result = self.fetch_one(&job, cancel).await;
                    (job, result)
                })
                .buffer_unordered(self.concurrency);
            tokio::pin!(tasks);

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        failure = Some(VodError::Cancelled);
                        break;
                    }
                    next = tasks.next() => next,
                };

                let Some((job, result)) = next else {
                    break;
                };

                match result {
                    Ok(bytes) => {
                        stats.segment_done(bytes);
                        debug!(
                            "Segment {} done ({} bytes, {}/{}, {}, eta {:?})",
                            job.index,
                            bytes,
                            stats.segments_completed,
                            stats.total_segments,
                            format_rate(stats.speed),
                            stats.eta.unwrap_or_default()
                        );
                        progress
                            .stage_percent(2, "Downloading", stats.percent())
                            .await;
                        fetched.push(FetchedSegment {
                            index: job.index,
                            path: job.path,
                            bytes,
                        });
                    }
                    Err(e) => {
                        if !e.is_cancelled() {
                            error!("Segment {} failed: {}", job.index, e);
                        }
                        failure = Some(e);
                        break;
                    }
                }
            }
            // Dropping the stream here aborts every in-flight sibling
        }

        if let Some(err) = failure {
            cleanup_segments(&paths).await;
            return Err(if cancel.is_cancelled() {
                VodError::Cancelled
            } else {
                err
            });
        }

        info!(
            "Fetched {} segments ({}) in {:.1}s",
            fetched.len(),
            format_bytes(stats.downloaded_bytes),
            stats.elapsed().as_secs_f64()
        );

        fetched.sort_by_key(|s| s.index);
        Ok(fetched)
    }

    fn job_for(&self, segment: &Segment, base_url: Option<&Url>) -> Result<FetchJob, VodError> {
        let url = resolve_uri(base_url, &segment.uri)?;
        let path = self
            .scratch_dir
            .join(format!("{:06}.{}", segment.index, segment_extension(&url)));
        Ok(FetchJob {
            index: segment.index,
            url,
            path,
        })
    }

    /// Download one segment with retries, returning its size
    async fn fetch_one(&self, job: &FetchJob, cancel: &CancellationToken) -> Result<u64, VodError> {
        let muted = muted_variant(&job.url);
        let use_muted = AtomicBool::new(false);
        let use_muted = &use_muted;

        retry_with_backoff(job.url.as_str(), &self.retry, cancel, |_, _| {
            let muted = muted.as_ref();
            async move {
                if let Some(muted) = muted.filter(|_| use_muted.load(Ordering::Relaxed)) {
                    return self.download_part(muted, &job.path, cancel).await;
                }
                match self.download_part(&job.url, &job.path, cancel).await {
                    Err(AttemptError::Transport(TransportError::Status(403))) if muted.is_some() => {
                        warn!("Segment {} is muted, falling back to muted part", job.index);
                        use_muted.store(true, Ordering::Relaxed);
                        match muted {
                            Some(muted) => self.download_part(muted, &job.path, cancel).await,
                            None => Err(TransportError::Status(403).into()),
                        }
                    }
                    other => other,
                }
            }
        })
        .await
    }

    /// Single attempt: stream `url` into `path` under the throttle
    async fn download_part(
        &self,
        url: &Url,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, AttemptError> {
        let mut body = tokio::select! {
            _ = cancel.cancelled() => return Err(VodError::Cancelled.into()),
            response = self.transport.get_stream(url) => response?,
        };

        let mut writer = BufWriter::new(File::create(path).await?);
        let mut written = 0u64;
        let mut first_byte = None;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(VodError::Cancelled.into()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            self.throttle.acquire(chunk.len(), cancel).await?;
            if first_byte.is_none() {
                first_byte = Some(chunk[0]);
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;

        verify_part(url, written, first_byte)?;
        Ok(written)
    }
}

/// Resolve a segment or rendition URI. Without a base the URI must be absolute.
pub fn resolve_uri(base: Option<&Url>, uri: &str) -> Result<Url, VodError> {
    let resolved = match base {
        Some(base) => base.join(uri),
        None => Url::parse(uri),
    };
    resolved.map_err(|e| VodError::validation(format!("cannot resolve URI `{}`: {}", uri, e)))
}

/// File extension of the URL path, `ts` when there is none
fn segment_extension(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "ts".to_string())
}

/// `12-unmuted.ts` becomes `12-muted.ts`
fn muted_variant(url: &Url) -> Option<Url> {
    if !url.path().contains("-unmuted") {
        return None;
    }
    let mut muted = url.clone();
    let path = url.path().replace("-unmuted", "-muted");
    muted.set_path(&path);
    Some(muted)
}

/// Reject parts that cannot be valid media
fn verify_part(url: &Url, len: u64, first_byte: Option<u8>) -> Result<(), TransportError> {
    if len == 0 {
        return Err(TransportError::Corrupt(format!("{} is empty", url)));
    }
    if segment_extension(url) == "ts" {
        if len % TS_PACKET_LEN != 0 {
            return Err(TransportError::Corrupt(format!(
                "{} is {} bytes, not a whole number of TS packets",
                url, len
            )));
        }
        if first_byte != Some(TS_SYNC_BYTE) {
            return Err(TransportError::Corrupt(format!("{} lacks the TS sync byte", url)));
        }
    }
    Ok(())
}
