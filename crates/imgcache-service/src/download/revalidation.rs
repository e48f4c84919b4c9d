//! Conditional requests against a cached validator.

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use url::Url;

use crate::caching::{CacheCoordinator, CacheEntry, CacheKey, StorageStrategy};
use crate::codec::Image;
use crate::utils::clock::Clock;

use super::{FetchError, HttpClient, ImageDecoder};

/// The outcome of a successful revalidation.
#[derive(Debug, Clone)]
pub enum Revalidation {
    /// The origin confirmed the cached image is current. The handle is the cached one.
    Reused(Image),
    /// The origin sent a new image, which has been written to the cache.
    Fresh { image: Image, etag: Option<String> },
}

/// Revalidates cached images with `If-None-Match`.
#[derive(Debug, Clone)]
pub struct RevalidationHandler {
    client: Arc<dyn HttpClient>,
    decoder: ImageDecoder,
    caches: Arc<CacheCoordinator>,
    clock: Arc<dyn Clock>,
}

impl RevalidationHandler {
    pub(super) fn new(
        client: Arc<dyn HttpClient>,
        decoder: ImageDecoder,
        caches: Arc<CacheCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            decoder,
            caches,
            clock,
        }
    }

    /// Asks the origin whether `cached_image`, stored with `cached_etag`, is still current.
    ///
    /// A `304 Not Modified` hands back the cached image without decoding anything and without
    /// touching the cache. A `200 OK` decodes the new image and stores it under `key` before
    /// returning it. Everything else is an error, there is no fallback to the cached image.
    pub async fn revalidate(
        &self,
        url: &Url,
        key: &CacheKey,
        headers: &HeaderMap,
        cached_image: Image,
        cached_etag: &str,
        storage: StorageStrategy,
    ) -> Result<Revalidation, FetchError> {
        let mut headers = headers.clone();
        let validator = HeaderValue::from_str(cached_etag)
            .map_err(|_| FetchError::InvalidResponse(format!("invalid etag `{cached_etag}`")))?;
        headers.insert(header::IF_NONE_MATCH, validator);

        let response = self.client.get(url, &headers).await?;
        match response.status {
            StatusCode::NOT_MODIFIED => {
                tracing::trace!(key = %key, "Cached image is still current");
                metric!(counter("fetch.revalidated") += 1, "outcome" => "reused");
                Ok(Revalidation::Reused(cached_image))
            }
            StatusCode::OK => {
                if response.body.is_empty() {
                    return Err(FetchError::EmptyBody);
                }
                let etag = response.etag();
                let image = self.decoder.decode(response.body).await?;

                let entry = CacheEntry::new(key.clone(), image.clone(), etag.clone(), self.clock.now());
                self.caches.store(entry, storage);

                tracing::trace!(key = %key, "Cached image was replaced by the origin");
                metric!(counter("fetch.revalidated") += 1, "outcome" => "fresh");
                Ok(Revalidation::Fresh { image, etag })
            }
            status if status.is_success() => Err(FetchError::InvalidResponse(format!(
                "unexpected status {status} for a conditional request"
            ))),
            status => Err(FetchError::Status(status)),
        }
    }
}
