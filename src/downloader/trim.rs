//! Trim window planning
//!
//! Selects the segments covering a `[start, end)` window. Network fetches work
//! at segment granularity; the exact cut is applied later by the muxer.

use crate::playlist::Segment;
use crate::utils::error::VodError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Requested time window in seconds. `None` means the start or end of the video.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrimWindow {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TrimWindow {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        Self { start, end }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Segments to keep and where to cut inside them
#[derive(Debug, Clone, PartialEq)]
pub struct TrimPlan {
    /// Positions (not sequence indices) of the retained segments
    pub retained: Range<usize>,
    /// Timeline position where the first retained segment starts
    pub retained_start: f64,
    /// Total duration of the retained segments
    pub retained_duration: f64,
    /// Exact window relative to the retained stream
    pub cut: CutWindow,
}

/// Window relative to the start of the concatenated retained segments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutWindow {
    pub start: f64,
    pub end: f64,
}

impl CutWindow {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl TrimPlan {
    /// Whether the window falls inside segments rather than on their edges
    pub fn needs_cut(&self) -> bool {
        const EPSILON: f64 = 1e-3;
        self.cut.start > EPSILON || (self.retained_duration - self.cut.end) > EPSILON
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}

/// Plan which segments cover `window`
pub fn plan(segments: &[Segment], window: TrimWindow) -> Result<TrimPlan, VodError> {
    let total: f64 = segments.iter().map(|s| s.duration).sum();
    let start = window.start.unwrap_or(0.0).max(0.0);
    let end = window.end.unwrap_or(total).min(total);

    if start >= end {
        return Err(VodError::validation(format!(
            "trim window [{:.3}, {:.3}) selects no segments of a {:.3}s video",
            start, end, total
        )));
    }

    let mut first = None;
    let mut last = None;
    let mut first_start = 0.0;
    let mut cumulative = 0.0;

    for (pos, segment) in segments.iter().enumerate() {
        let seg_start = cumulative;
        let seg_end = cumulative + segment.duration;
        if first.is_none() && seg_end > start {
            first = Some(pos);
            first_start = seg_start;
        }
        if seg_start < end {
            last = Some(pos);
        }
        cumulative = seg_end;
    }

    let (Some(first), Some(last)) = (first, last) else {
        return Err(VodError::validation("trim window selects no segments"));
    };
    if first > last {
        return Err(VodError::validation("trim window selects no segments"));
    }

    let retained_duration = segments[first..=last].iter().map(|s| s.duration).sum();

    Ok(TrimPlan {
        retained: first..last + 1,
        retained_start: first_start,
        retained_duration,
        cut: CutWindow {
            start: start - first_start,
            end: end - first_start,
        },
    })
}
