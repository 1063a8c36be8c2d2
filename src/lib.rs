//! vodloader library
//!
//! Downloads HLS video-on-demand playlists: rendition selection, throttled
//! concurrent segment fetching, trimming and remuxing into one file.

pub mod downloader;
pub mod playlist;
pub mod utils;

// Re-export main types for easier use
pub use downloader::{
    DownloadOptions, DownloadState, HttpTransport, PlaylistSource, ProgressEvent, Transport,
    TrimWindow, VodDownloader,
};
pub use playlist::{parse, Playlist};
pub use utils::{DownloaderSettings, VodError};
