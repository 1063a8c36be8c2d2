//! Network access for playlists and segments
//!
//! The engine only talks to the network through [`Transport`], which keeps
//! the fetch scheduler independent from the HTTP client in use.

use crate::utils::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Body of a segment response, chunk by chunk
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a text document such as a playlist
    async fn get_text(&self, url: &Url) -> Result<String, TransportError>;

    /// Open a streaming download
    async fn get_stream(&self, url: &Url) -> Result<ByteStream, TransportError>;
}

/// Limit on waiting for response headers, a text body, or the next body chunk
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Transport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("vodloader/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self { client, timeout })
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: REQUEST_TIMEOUT,
        }
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, TransportError> {
        debug!("GET {}", url);
        let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &Url) -> Result<String, TransportError> {
        let response = self.get(url).await?;
        tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_reqwest_error)
    }

    async fn get_stream(&self, url: &Url) -> Result<ByteStream, TransportError> {
        let response = self.get(url).await?;
        let timeout = self.timeout;
        // Only time spent waiting on the server counts, not throttle waits
        // between polls.
        let body = response.bytes_stream().map_err(map_reqwest_error).boxed();
        let stream = futures::stream::unfold(Some(body), move |body| async move {
            let mut body = body?;
            match tokio::time::timeout(timeout, body.next()).await {
                Ok(Some(chunk)) => Some((chunk, Some(body))),
                Ok(None) => None,
                Err(_) => Some((Err(TransportError::Timeout), None)),
            }
        });
        Ok(stream.boxed())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = err.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Request(err.to_string())
    }
}
