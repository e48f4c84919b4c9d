//! The HTTP transport seam.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::config::Config;

use super::FetchError;

/// Extra headers sent along with an image request, e.g. for authorization.
pub type RequestHeaders = BTreeMap<String, String>;

/// A complete HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// The validator sent by the origin, if any.
    pub fn etag(&self) -> Option<String> {
        let value = self.headers.get(header::ETAG)?;
        value.to_str().ok().map(str::to_owned)
    }
}

/// Performs GET requests.
///
/// The fetch machinery only ever talks to this trait, which makes the transport replaceable.
#[async_trait]
pub trait HttpClient: fmt::Debug + Send + Sync + 'static {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<HttpResponse, FetchError>;
}

/// Converts caller supplied headers, skipping names or values that are not valid HTTP.
pub fn header_map(headers: &RequestHeaders) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes());
        let value = HeaderValue::from_str(value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::debug!(header = key.as_str(), "Skipping invalid request header"),
        }
    }
    map
}

/// Various timeouts for image downloads.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `user_agent` is sent with every request.
pub fn create_client(timeouts: &DownloadTimeouts, user_agent: &str) -> Result<Client, FetchError> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(user_agent)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| FetchError::Transport(e.to_string()))
}

/// The default [`HttpClient`], backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let timeouts = DownloadTimeouts::from_config(config);
        create_client(&timeouts, &config.user_agent).map(Self::new)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<HttpResponse, FetchError> {
        tracing::debug!("Fetching image from `{}`", url);

        let response = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        tracing::trace!(%status, size = body.len(), "Received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
