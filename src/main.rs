//! vodloader - HLS VOD downloader
//!
//! Downloads a VOD playlist with throttled parallel segment fetching,
//! optional trimming, and remuxing through ffmpeg.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use url::Url;
use vodloader::downloader::{
    DownloadOptions, HttpTransport, PlaylistSource, ProgressEvent, TrimWindow, VideoMetadata,
    VodDownloader,
};
use vodloader::utils::{parse_timecode, render_filename, DownloaderSettings, FilenameFields, VodError};

#[derive(Parser)]
#[command(name = "vodloader", version, about = "Download HLS video-on-demand playlists")]
struct Args {
    /// Playlist URL or path to a local .m3u8 file
    playlist: String,

    /// Base URL for relative URIs in a local playlist
    #[arg(long)]
    base_url: Option<Url>,

    /// Quality to download, e.g. 1080p60 or "Audio Only" (default: best)
    #[arg(short, long)]
    quality: Option<String>,

    /// Output file; the extension is chosen from the quality when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Parallel segment downloads
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Download rate cap in KiB/s (negative for unlimited)
    #[arg(long, allow_negative_numbers = true)]
    throttle_kib: Option<i64>,

    /// Disable the download rate cap
    #[arg(long, conflicts_with = "throttle_kib")]
    no_throttle: bool,

    /// Trim start, e.g. 1h2m3s, 01:02:03 or 3723
    #[arg(long, value_parser = timecode)]
    start: Option<f64>,

    /// Trim end, e.g. 1h30m or 01:30:00
    #[arg(long, value_parser = timecode)]
    end: Option<f64>,

    /// Directory for temporary segment files
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Path to ffmpeg (default: from settings or PATH)
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Video title, used for metadata and the default file name
    #[arg(long)]
    title: Option<String>,

    /// Channel name, used for metadata and the default file name
    #[arg(long)]
    channel: Option<String>,

    /// Print the available qualities and exit
    #[arg(long)]
    list_qualities: bool,

    /// Settings file (default: <config dir>/vodloader/settings.json)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Store thread and throttle arguments as new defaults
    #[arg(long)]
    save_settings: bool,

    /// Debug logging and full error details
    #[arg(short, long)]
    verbose: bool,
}

fn timecode(value: &str) -> Result<f64, String> {
    parse_timecode(value).map_err(|e| e.to_string())
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let settings_path = args.settings.clone().or_else(DownloaderSettings::default_path);
    let mut settings = settings_path
        .as_deref()
        .map(DownloaderSettings::load)
        .unwrap_or_default();
    let verbose = args.verbose || settings.verbose_errors;

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = match rt.block_on(run(args, &mut settings, settings_path)) {
        Ok(()) => 0,
        Err(e) => {
            let cancelled = e
                .downcast_ref::<VodError>()
                .map(VodError::is_cancelled)
                .unwrap_or(false);
            if cancelled {
                eprintln!("\nDownload cancelled");
                130
            } else {
                eprintln!("\nError: {}", e);
                if verbose {
                    eprintln!("{:?}", e);
                }
                1
            }
        }
    };
    std::process::exit(code);
}

async fn run(
    args: Args,
    settings: &mut DownloaderSettings,
    settings_path: Option<PathBuf>,
) -> Result<()> {
    if let Some(threads) = args.threads {
        settings.download_threads = threads;
    }
    if args.no_throttle {
        settings.throttle_downloads = false;
    } else if let Some(kib) = args.throttle_kib {
        settings.throttle_downloads = kib >= 0;
        if kib >= 0 {
            settings.max_download_speed_kib = kib as u64;
        }
    }
    if args.save_settings {
        if let Some(path) = &settings_path {
            settings
                .save(path)
                .with_context(|| format!("failed to save settings to {}", path.display()))?;
            println!("Saved settings to {}", path.display());
        }
    }

    let playlist = playlist_source(&args.playlist, args.base_url.clone())?;
    let metadata = VideoMetadata {
        title: args.title.clone(),
        channel: args.channel.clone(),
        created_at: None,
    };
    let output = match &args.output {
        Some(output) => output.clone(),
        None => default_output(settings, &args),
    };

    let mut options = DownloadOptions::from_settings(playlist, output, settings);
    options.quality = args.quality.clone();
    options.trim = TrimWindow::new(args.start, args.end);
    if let Some(temp_dir) = &args.temp_dir {
        options.temp_dir = temp_dir.clone();
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        options.ffmpeg_path = Some(ffmpeg.clone());
    }
    options.metadata = Some(metadata).filter(|m| !m.is_empty());

    let transport = Arc::new(HttpTransport::new().context("failed to create HTTP client")?);
    let downloader = VodDownloader::new(options, transport);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    if args.list_qualities {
        let info = downloader.probe(&cancel).await?;
        if info.qualities.is_empty() {
            println!("Media playlist: a single quality is available");
        }
        for label in info.labels(args.start, args.end) {
            println!("{}", label);
        }
        return Ok(());
    }

    let (progress_tx, progress_rx) = mpsc::channel::<ProgressEvent>(100);
    let printer = tokio::spawn(print_progress(progress_rx));

    let result = downloader.download(progress_tx, cancel).await;
    // The downloader dropped its sender, so the printer drains and exits
    let _ = printer.await;

    let path = result?;
    println!("\nSaved to {}", path.display());
    Ok(())
}

fn playlist_source(input: &str, base_url: Option<Url>) -> Result<PlaylistSource> {
    if let Ok(url) = Url::parse(input) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(PlaylistSource::Url(url));
        }
    }
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read playlist {}", input))?;
    Ok(PlaylistSource::Inline { text, base_url })
}

/// File name from the settings template, or a timestamped name without a title
fn default_output(settings: &DownloaderSettings, args: &Args) -> PathBuf {
    match &args.title {
        Some(title) => {
            let fields = FilenameFields {
                title: title.clone(),
                channel: args.channel.clone().unwrap_or_default(),
                created_at: Some(Utc::now()),
                trim_start: args.start.unwrap_or(0.0),
                trim_end: args.end,
                ..Default::default()
            };
            PathBuf::from(render_filename(&settings.filename_template, &fields))
        }
        None => PathBuf::from(format!("vod_{}", Utc::now().format("%Y%m%d_%H%M%S"))),
    }
}

async fn print_progress(mut rx: mpsc::Receiver<ProgressEvent>) {
    let mut stdout = std::io::stdout();
    let mut on_status_line = false;
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::Percent(_) => {}
            ProgressEvent::Status {
                message,
                same_line: true,
            } => {
                print!("\r\x1b[2K{}", message);
                let _ = stdout.flush();
                on_status_line = true;
            }
            ProgressEvent::Status { message, .. } | ProgressEvent::Log(message) => {
                if on_status_line {
                    println!();
                    on_status_line = false;
                }
                println!("{}", message);
            }
        }
    }
}
