//! Utility modules for error handling, configuration and formatting

pub mod config;
pub mod error;
pub mod filename;
pub mod format;
pub mod timecode;

// Re-export for convenience
pub use config::DownloaderSettings;
pub use error::{MuxError, NetworkError, ParseError, TransportError, VodError};
pub use filename::{render_filename, FilenameFields};
pub use format::{format_bytes, format_rate};
pub use timecode::{format_duration, format_timestamp, parse_timecode};
