//! Error handling for vodloader

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for a download run
#[derive(Debug, Error)]
pub enum VodError {
    #[error("Playlist parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid options: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("Download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VodError {
    pub fn validation(msg: impl Into<String>) -> Self {
        VodError::Validation(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VodError::Cancelled)
    }
}

/// A malformed playlist line. Parsing stops at the first one.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {reason} (`{content}`)")]
pub struct ParseError {
    /// 1-based line number
    pub line: usize,
    pub content: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: usize, content: &str, reason: impl Into<String>) -> Self {
        Self {
            line,
            content: content.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of a single network request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,

    #[error("corrupt part: {0}")]
    Corrupt(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status(code) => {
                matches!(code, 408 | 425 | 429) || (500..600).contains(code)
            }
            TransportError::Request(_) | TransportError::Timeout | TransportError::Corrupt(_) => {
                true
            }
        }
    }
}

/// A playlist or segment fetch that failed for good
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{url} failed after {attempts} attempt(s): {source}")]
pub struct NetworkError {
    pub url: String,
    pub attempts: u32,
    pub source: TransportError,
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("media tool not found: {0}")]
    ToolNotFound(PathBuf),

    #[error("failed to launch media tool: {0}")]
    Spawn(std::io::Error),

    #[error("media tool exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("no segments to merge")]
    NoSegments,
}
