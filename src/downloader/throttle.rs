//! Shared download rate limiter
//!
//! One governor limiter per run, counting one cell per byte. Every worker
//! takes its chunks from the same limiter so aggregate throughput across all
//! workers never exceeds the configured rate.

use crate::utils::error::VodError;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Largest single acquisition. Bigger chunks are split so concurrent
/// workers interleave instead of one chunk holding the whole budget.
pub const MAX_ACQUIRE: usize = 16 * 1024;

type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Configured rate cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThrottleRate {
    #[default]
    Unlimited,
    BytesPerSec(u64),
}

impl ThrottleRate {
    /// Rate in KiB/s where a negative value means unlimited
    pub fn from_kib(kib: i64) -> Self {
        if kib < 0 {
            ThrottleRate::Unlimited
        } else {
            ThrottleRate::BytesPerSec((kib as u64).saturating_mul(1024))
        }
    }
}

/// Cloneable handle to one shared limiter
#[derive(Clone, Default)]
pub struct Throttle {
    limiter: Option<SharedLimiter>,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("limited", &self.is_limited())
            .finish()
    }
}

impl Throttle {
    pub fn new(rate: ThrottleRate) -> Self {
        let bps = match rate {
            ThrottleRate::Unlimited => return Self::unlimited(),
            ThrottleRate::BytesPerSec(bps) => u32::try_from(bps).unwrap_or(u32::MAX),
        };
        let Some(per_second) = NonZeroU32::new(bps) else {
            return Self::unlimited();
        };

        // Holds at most one second of budget after idling, and never less
        // than one slice
        let burst = NonZeroU32::new(bps.max(MAX_ACQUIRE as u32)).unwrap_or(per_second);
        let limiter = RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst));
        // Start empty so the first second is paced like the rest
        let _ = limiter.check_n(burst);

        Self {
            limiter: Some(Arc::new(limiter)),
        }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: usize, cancel: &CancellationToken) -> Result<(), VodError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        let mut remaining = bytes;
        while remaining > 0 {
            let take = remaining.min(MAX_ACQUIRE);
            remaining -= take;
            let Some(cells) = NonZeroU32::new(take as u32) else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(VodError::Cancelled),
                ready = limiter.until_n_ready(cells) => {
                    ready.map_err(|e| VodError::Validation(format!("throttle slice too large: {}", e)))?;
                }
            }
        }

        Ok(())
    }
}
