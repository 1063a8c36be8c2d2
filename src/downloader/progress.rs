//! Progress reporting for downloads

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Number of user-visible stages in a run
pub const TOTAL_STAGES: u8 = 4;

/// Event delivered to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Percent complete of the current stage, 0-100
    Percent(u8),
    /// Status line. `same_line` replaces the previous status instead of appending.
    Status { message: String, same_line: bool },
    /// Log line
    Log(String),
}

/// Sends progress events to the caller, one at a time and in order.
///
/// Percent values never decrease within a stage and never exceed 100.
/// A dropped receiver is not an error; events are then discarded.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    last_percent: AtomicU8,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            last_percent: AtomicU8::new(0),
        }
    }

    /// A reporter that drops every event
    pub fn disabled() -> Self {
        Self {
            tx: None,
            last_percent: AtomicU8::new(0),
        }
    }

    /// Start a new stage: resets the percent floor
    pub async fn begin_stage(&self, stage: u8, label: &str) {
        self.last_percent.store(0, Ordering::SeqCst);
        info!("{} [{}/{}]", label, stage, TOTAL_STAGES);
        self.send(ProgressEvent::Status {
            message: format!("{} [{}/{}]", label, stage, TOTAL_STAGES),
            same_line: false,
        })
        .await;
        self.send(ProgressEvent::Percent(0)).await;
    }

    /// Report percent for the current stage. Every call emits an event;
    /// values below the last reported one are raised to it and values above
    /// 100 are clamped.
    pub async fn percent(&self, percent: u8) {
        let percent = self.raise_floor(percent);
        self.send(ProgressEvent::Percent(percent)).await;
    }

    /// Percent plus a same-line status such as `Downloading 45% [2/4]`
    pub async fn stage_percent(&self, stage: u8, label: &str, percent: u8) {
        let percent = self.raise_floor(percent);
        self.send(ProgressEvent::Percent(percent)).await;
        self.send(ProgressEvent::Status {
            message: format!("{} {}% [{}/{}]", label, percent, stage, TOTAL_STAGES),
            same_line: true,
        })
        .await;
    }

    fn raise_floor(&self, percent: u8) -> u8 {
        let percent = percent.min(100);
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        percent.max(previous)
    }

    pub async fn status(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Status {
            message: message.into(),
            same_line: false,
        })
        .await;
    }

    pub async fn log(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Log(message.into())).await;
    }

    async fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                debug!("Progress receiver dropped, discarding event");
            }
        }
    }
}

/// Byte and segment counters for a transfer, with speed and ETA
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub total_segments: usize,
    pub segments_completed: usize,
    pub downloaded_bytes: u64,
    pub speed: f64, // bytes per second
    pub eta: Option<Duration>,
    started: Instant,
}

impl TransferStats {
    pub fn new(total_segments: usize) -> Self {
        Self {
            total_segments,
            segments_completed: 0,
            downloaded_bytes: 0,
            speed: 0.0,
            eta: None,
            started: Instant::now(),
        }
    }

    /// Record one finished segment of `bytes`
    pub fn segment_done(&mut self, bytes: u64) {
        self.segments_completed += 1;
        self.downloaded_bytes += bytes;

        let elapsed = self.started.elapsed().as_secs_f64();
        self.speed = if elapsed > 0.0 {
            self.downloaded_bytes as f64 / elapsed
        } else {
            0.0
        };

        // Estimate remaining time from average segment size
        let remaining = self.total_segments.saturating_sub(self.segments_completed);
        if remaining == 0 {
            self.eta = Some(Duration::from_secs(0));
        } else if self.speed > 0.0 && self.segments_completed > 0 {
            let avg = self.downloaded_bytes as f64 / self.segments_completed as f64;
            self.eta = Some(Duration::from_secs_f64(avg * remaining as f64 / self.speed));
        } else {
            self.eta = None;
        }
    }

    /// Completed segments as 0-100
    pub fn percent(&self) -> u8 {
        if self.total_segments == 0 {
            return 100;
        }
        let pct = self.segments_completed * 100 / self.total_segments;
        pct.min(100) as u8
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
