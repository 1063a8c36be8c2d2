//! Download lifecycle states

use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Where a run currently is. States only move forward; `Cancelled` may be
/// entered from any state that is not terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadState {
    Idle,
    PlaylistFetching,
    RenditionSelected { name: String },
    SegmentFetching { total: usize },
    Trimming,
    Muxing,
    Done(PathBuf),
    Failed(String),
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Done(_) | DownloadState::Failed(_) | DownloadState::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            DownloadState::Idle => 0,
            DownloadState::PlaylistFetching => 1,
            DownloadState::RenditionSelected { .. } => 2,
            DownloadState::SegmentFetching { .. } => 3,
            DownloadState::Trimming => 4,
            DownloadState::Muxing => 5,
            DownloadState::Done(_) | DownloadState::Failed(_) | DownloadState::Cancelled => 6,
        }
    }

    /// Whether `next` may follow `self`
    pub fn can_transition_to(&self, next: &DownloadState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DownloadState::Cancelled | DownloadState::Failed(_) => true,
            DownloadState::Done(_) => matches!(self, DownloadState::Muxing),
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadState::Idle => write!(f, "Idle"),
            DownloadState::PlaylistFetching => write!(f, "Fetching playlist"),
            DownloadState::RenditionSelected { name } => write!(f, "Selected {}", name),
            DownloadState::SegmentFetching { total } => write!(f, "Fetching {} segments", total),
            DownloadState::Trimming => write!(f, "Trimming"),
            DownloadState::Muxing => write!(f, "Muxing"),
            DownloadState::Done(path) => write!(f, "Done: {}", path.display()),
            DownloadState::Failed(reason) => write!(f, "Failed: {}", reason),
            DownloadState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Owns the current state and publishes every change
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<DownloadState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DownloadState::Idle);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> DownloadState {
        self.tx.borrow().clone()
    }

    /// Move to `next`. Returns false and leaves the state unchanged when the
    /// transition is not allowed.
    pub fn advance(&self, next: DownloadState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(&next) {
                debug!("State {} -> {}", state, next);
                *state = next.clone();
                applied = true;
            }
            applied
        });
        if !applied {
            warn!("Ignoring state transition to {}", next);
        }
        applied
    }
}
