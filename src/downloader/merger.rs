//! Segment concatenation and remuxing

use crate::downloader::options::VideoMetadata;
use crate::downloader::progress::ProgressReporter;
use crate::downloader::trim::CutWindow;
use crate::utils::error::{MuxError, VodError};
use crate::utils::timecode::format_timestamp;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of tool stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// Merge segments into a single file, in the order given.
/// Returns the number of bytes written.
pub async fn merge_segments(
    segments: &[PathBuf],
    output_path: &Path,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<u64, VodError> {
    if segments.is_empty() {
        return Err(MuxError::NoSegments.into());
    }

    debug!(
        "Merging {} segments into {}",
        segments.len(),
        output_path.display()
    );

    let mut expected = 0u64;
    for segment_path in segments {
        expected += tokio::fs::metadata(segment_path).await?.len();
    }

    let mut output_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output_path)
        .await?;

    let mut total_bytes = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];

    for (i, segment_path) in segments.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(VodError::Cancelled);
        }

        let mut segment_file = File::open(segment_path).await?;
        let mut bytes_copied = 0u64;

        loop {
            let bytes_read = segment_file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }

            output_file.write_all(&buffer[..bytes_read]).await?;
            bytes_copied += bytes_read as u64;
            total_bytes += bytes_read as u64;
        }

        if expected > 0 {
            let pct = (total_bytes * 100 / expected).min(100) as u8;
            progress.stage_percent(3, "Combining Parts", pct).await;
        }
        debug!("Merged segment {} ({} bytes)", i, bytes_copied);
    }

    output_file.flush().await?;

    info!(
        "Merged {} bytes into {}",
        total_bytes,
        output_path.display()
    );

    Ok(total_bytes)
}

/// Remove temporary segment files, logging failures
pub async fn cleanup_segments(segments: &[PathBuf]) {
    for segment_path in segments {
        match tokio::fs::remove_file(segment_path).await {
            Ok(()) => debug!("Removed segment file: {}", segment_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove segment file {}: {}",
                segment_path.display(),
                e
            ),
        }
    }
}

/// Everything needed to produce one output file
#[derive(Debug, Clone)]
pub struct MuxJob {
    /// Fetched parts in playback order
    pub parts: Vec<PathBuf>,
    pub output: PathBuf,
    /// Precise window within the concatenated parts, when one is needed
    pub cut: Option<CutWindow>,
    /// Seconds of media in the concatenated parts
    pub duration: f64,
}

impl MuxJob {
    /// Expected length of the output in seconds
    fn output_duration(&self) -> f64 {
        self.cut.map(|c| c.duration()).unwrap_or(self.duration)
    }
}

/// Joins fetched parts and hands them to the external muxer
#[derive(Debug, Clone)]
pub struct Muxer {
    ffmpeg: Option<PathBuf>,
    scratch_dir: PathBuf,
    metadata: Option<VideoMetadata>,
}

impl Muxer {
    pub fn new(ffmpeg: Option<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg,
            scratch_dir: scratch_dir.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<VideoMetadata>) -> Self {
        self.metadata = metadata.filter(|m| !m.is_empty());
        self
    }

    /// Produce `job.output`. The output is removed again if anything fails.
    pub async fn mux(
        &self,
        job: &MuxJob,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), VodError> {
        let result = self.mux_inner(job, progress, cancel).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&job.output).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial output {}: {}", job.output.display(), e);
                }
            }
        }
        result
    }

    async fn mux_inner(
        &self,
        job: &MuxJob,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), VodError> {
        progress.begin_stage(3, "Combining Parts").await;
        let combined = self.scratch_dir.join("combined.ts");
        merge_segments(&job.parts, &combined, progress, cancel).await?;
        cleanup_segments(&job.parts).await;

        progress.begin_stage(4, "Finalizing Video").await;
        match &self.ffmpeg {
            Some(ffmpeg) => {
                let metadata_file = match &self.metadata {
                    Some(metadata) => {
                        let path = self.scratch_dir.join("metadata.txt");
                        write_metadata_file(&path, metadata).await?;
                        Some(path)
                    }
                    None => None,
                };
                let args = ffmpeg_args(
                    &combined,
                    metadata_file.as_deref(),
                    job.cut,
                    &job.output,
                );
                run_tool(ffmpeg, args, job.output_duration(), progress, cancel).await?;
            }
            None => {
                if job.cut.is_some() {
                    progress
                        .log("No ffmpeg available, output is cut at segment boundaries")
                        .await;
                    warn!("Trim window applied at segment granularity only");
                }
                move_file(&combined, &job.output).await?;
            }
        }

        progress.percent(100).await;
        info!("Wrote {}", job.output.display());
        Ok(())
    }
}

/// Arguments for a stream-copy remux of `input` into `output`
pub fn ffmpeg_args(
    input: &Path,
    metadata: Option<&Path>,
    cut: Option<CutWindow>,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-nostats",
        "-loglevel",
        "error",
        "-progress",
        "pipe:1",
        "-y",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    if let Some(cut) = cut {
        if cut.start > 0.0 {
            args.push("-ss".into());
            args.push(format_timestamp(cut.start).into());
        }
    }
    args.push("-i".into());
    args.push(input.into());

    if let Some(metadata) = metadata {
        args.push("-i".into());
        args.push(metadata.into());
    }
    if let Some(cut) = cut {
        args.push("-t".into());
        args.push(format_timestamp(cut.duration()).into());
    }

    args.push("-map".into());
    args.push("0".into());
    if metadata.is_some() {
        args.push("-map_metadata".into());
        args.push("1".into());
    }
    args.push("-c".into());
    args.push("copy".into());

    let is_mp4_family = output
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "mp4" | "m4a" | "mov"))
        .unwrap_or(false);
    if is_mp4_family {
        for arg in ["-bsf:a", "aac_adtstoasc", "-movflags", "+faststart"] {
            args.push(arg.into());
        }
    }

    args.push(output.into());
    args
}

/// Run the muxer, translating `out_time_us` progress lines into percent
async fn run_tool(
    tool: &Path,
    args: Vec<OsString>,
    duration: f64,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(), VodError> {
    debug!("Running {} {:?}", tool.display(), args);

    let mut child = Command::new(tool)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MuxError::ToolNotFound(tool.to_path_buf()),
            _ => MuxError::Spawn(e),
        })?;

    // Drain stderr concurrently so the tool never blocks on a full pipe
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", tool.display(), e);
                    }
                    return Err(VodError::Cancelled);
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            if let Some(pct) = parse_progress_line(&line, duration) {
                progress.stage_percent(4, "Finalizing Video", pct).await;
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", tool.display(), e);
            }
            return Err(VodError::Cancelled);
        }
        status = child.wait() => status?,
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        return Err(MuxError::ExitStatus {
            status: status.to_string(),
            stderr,
        }
        .into());
    }
    if !stderr.is_empty() {
        debug!("{} stderr: {}", tool.display(), stderr);
    }
    Ok(())
}

/// Percent from an `out_time_us=` (or the identically scaled `out_time_ms=`) line
fn parse_progress_line(line: &str, duration: f64) -> Option<u8> {
    let (key, value) = line.trim().split_once('=')?;
    if key != "out_time_us" && key != "out_time_ms" {
        return None;
    }
    let micros: i64 = value.trim().parse().ok()?;
    if duration <= 0.0 || micros < 0 {
        return None;
    }
    let pct = micros as f64 / 1_000_000.0 / duration * 100.0;
    Some(pct.clamp(0.0, 100.0) as u8)
}

/// Write an ffmpeg metadata file with the video's tags
pub async fn write_metadata_file(path: &Path, metadata: &VideoMetadata) -> Result<(), VodError> {
    let mut text = String::from(";FFMETADATA1\n");
    if let Some(title) = &metadata.title {
        text.push_str(&format!("title={}\n", escape_metadata(title)));
    }
    if let Some(channel) = &metadata.channel {
        text.push_str(&format!("artist={}\n", escape_metadata(channel)));
    }
    if let Some(created_at) = &metadata.created_at {
        text.push_str(&format!("date={}\n", created_at.format("%Y-%m-%d")));
        text.push_str(&format!("creation_time={}\n", created_at.to_rfc3339()));
    }
    tokio::fs::write(path, text).await?;
    Ok(())
}

fn escape_metadata(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Rename, falling back to copy + delete across file systems
async fn move_file(from: &Path, to: &Path) -> Result<(), VodError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    if let Err(e) = tokio::fs::remove_file(from).await {
        warn!("Failed to remove {}: {}", from.display(), e);
    }
    Ok(())
}
