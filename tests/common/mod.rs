//! Shared fixtures: an in-memory transport and playlist builders.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;
use vodloader::downloader::{ByteStream, Transport};
use vodloader::utils::TransportError;

pub const BASE: &str = "https://vod.test/abc123/";

#[derive(Clone)]
enum Reply {
    Body(Vec<Bytes>),
    Error(TransportError),
}

struct Route {
    /// Errors returned before the reply, one per request
    failures: Vec<TransportError>,
    reply: Reply,
    delay: Duration,
}

/// Transport serving canned responses from memory
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    default_delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.default_delay.lock().unwrap() = delay;
        self
    }

    fn insert(&self, url: &str, reply: Reply) {
        let delay = *self.default_delay.lock().unwrap();
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                failures: Vec::new(),
                reply,
                delay,
            },
        );
    }

    pub fn text(&self, url: &str, body: &str) {
        self.insert(url, Reply::Body(vec![Bytes::from(body.to_string())]));
    }

    pub fn body(&self, url: &str, body: Vec<u8>) {
        self.insert(url, Reply::Body(vec![Bytes::from(body)]));
    }

    /// Serve the body split into chunks of `chunk` bytes
    pub fn chunked(&self, url: &str, body: Vec<u8>, chunk: usize) {
        let chunks = body.chunks(chunk).map(Bytes::copy_from_slice).collect();
        self.insert(url, Reply::Body(chunks));
    }

    pub fn error(&self, url: &str, err: TransportError) {
        self.insert(url, Reply::Error(err));
    }

    /// Fail the next requests to `url` with the given errors, in order
    pub fn fail_first(&self, url: &str, failures: Vec<TransportError>) {
        if let Some(route) = self.routes.lock().unwrap().get_mut(url) {
            route.failures = failures;
        }
    }

    pub fn set_delay(&self, url: &str, delay: Duration) {
        if let Some(route) = self.routes.lock().unwrap().get_mut(url) {
            route.delay = delay;
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, url: &Url) -> Result<Vec<Bytes>, TransportError> {
        let key = url.as_str().to_string();
        self.requests.lock().unwrap().push(key.clone());

        let (delay, outcome) = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&key) {
                None => (Duration::ZERO, Err(TransportError::Status(404))),
                Some(route) if !route.failures.is_empty() => {
                    (route.delay, Err(route.failures.remove(0)))
                }
                Some(route) => match &route.reply {
                    Reply::Body(chunks) => (route.delay, Ok(chunks.clone())),
                    Reply::Error(err) => (route.delay, Err(err.clone())),
                },
            }
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        outcome
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_text(&self, url: &Url) -> Result<String, TransportError> {
        let chunks = self.respond(url).await?;
        let bytes: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        String::from_utf8(bytes).map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn get_stream(&self, url: &Url) -> Result<ByteStream, TransportError> {
        let chunks = self.respond(url).await?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

pub fn url(path: &str) -> String {
    format!("{}{}", BASE, path)
}

/// A valid MPEG-TS part of `packets` packets, tagged with `tag` after the sync byte
pub fn ts_part(tag: u8, packets: usize) -> Vec<u8> {
    let mut data = vec![tag; 188 * packets];
    for packet in data.chunks_mut(188) {
        packet[0] = 0x47;
    }
    data
}

/// Media playlist with one `{i}.ts` segment per duration
pub fn media_playlist(durations: &[f64]) -> String {
    let target = durations.iter().cloned().fold(0.0_f64, f64::max).ceil();
    let mut text = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n",
        target
    );
    for (i, d) in durations.iter().enumerate() {
        text.push_str(&format!("#EXTINF:{:.3},\n{}.ts\n", d, i));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Register a media playlist at `dir/index-dvr.m3u8` and its segments.
/// Returns the expected concatenation of all parts.
pub fn serve_rendition(transport: &MockTransport, dir: &str, durations: &[f64], tag_base: u8) -> Vec<Vec<u8>> {
    transport.text(&url(&format!("{}/index-dvr.m3u8", dir)), &media_playlist(durations));
    (0..durations.len())
        .map(|i| {
            let part = ts_part(tag_base.wrapping_add(i as u8), 2);
            transport.body(&url(&format!("{}/{}.ts", dir, i)), part.clone());
            part
        })
        .collect()
}

pub const MASTER: &str = r#"#EXTM3U
#EXT-X-TWITCH-INFO:ORIGIN="s3",B="false"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="chunked",NAME="1080p60",AUTOSELECT=NO,DEFAULT=NO
#EXT-X-STREAM-INF:BANDWIDTH=6000000,CODECS="avc1.64002A,mp4a.40.2",RESOLUTION=1920x1080,VIDEO="chunked",FRAME-RATE=60.000
chunked/index-dvr.m3u8
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="audio_only",NAME="Audio Only",AUTOSELECT=NO,DEFAULT=NO
#EXT-X-STREAM-INF:BANDWIDTH=160000,CODECS="mp4a.40.2",VIDEO="audio_only"
audio_only/index-dvr.m3u8
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="720p60",NAME="720p60",AUTOSELECT=YES,DEFAULT=YES
#EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS="avc1.4D401F,mp4a.40.2",RESOLUTION=1280x720,VIDEO="720p60",FRAME-RATE=60.000
720p60/index-dvr.m3u8
"#;

pub fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.iter().flatten().copied().collect()
}

/// Entries left in a directory
pub fn dir_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
