//! Download engine module

pub mod engine;
pub mod fetcher;
pub mod merger;
pub mod options;
pub mod progress;
pub mod retry;
pub mod state;
pub mod throttle;
pub mod transport;
pub mod trim;

// Re-export for convenience
pub use engine::{PlaylistInfo, VodDownloader};
pub use fetcher::{FetchedSegment, SegmentFetcher};
pub use merger::{MuxJob, Muxer};
pub use options::{DownloadOptions, PlaylistSource, VideoMetadata};
pub use progress::{ProgressEvent, ProgressReporter};
pub use retry::RetryPolicy;
pub use state::DownloadState;
pub use throttle::{Throttle, ThrottleRate};
pub use transport::{ByteStream, HttpTransport, Transport};
pub use trim::{TrimPlan, TrimWindow};
