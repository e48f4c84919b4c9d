//! Fetching images from the network, with cache strategies and request deduplication.
//!
//! The [`FetchCoordinator`] consults the caches according to the requested [`CacheStrategy`],
//! goes to the network through an [`HttpClient`] when needed and writes fresh images back into
//! the caches. Concurrent fetches for the same image share a single network operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tokio::runtime::Handle;
use url::Url;

use crate::caching::{CacheCoordinator, CacheEntry, CacheKey, StorageStrategy};
use crate::codec::{Image, ImageCodec};
use crate::utils::clock::Clock;
use crate::utils::defer::defer;

mod fetch_error;
mod http;
mod revalidation;

pub use fetch_error::FetchError;
pub use http::{
    DownloadTimeouts, HttpClient, HttpResponse, ReqwestClient, RequestHeaders, create_client,
    header_map,
};
pub use revalidation::{Revalidation, RevalidationHandler};

/// How the caches are consulted before going to the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Serve from cache when possible, fetch otherwise.
    #[default]
    CacheFirst,
    /// Ask the origin whether the cached image is still current, using its ETag.
    ///
    /// Falls back to an unconditional fetch when nothing, or nothing with an ETag, is cached.
    EtagValidation,
    /// Always fetch, replacing whatever is cached.
    ForceDownload,
}

/// A successfully loaded image, and where it came from.
#[derive(Debug, Clone)]
pub enum DownloadResult {
    /// Freshly fetched from the network.
    Success(Image),
    /// Served from cache without any network traffic.
    Cached(Image),
    /// Served from cache after the origin confirmed it is current.
    Validated(Image),
}

impl DownloadResult {
    pub fn image(&self) -> &Image {
        match self {
            Self::Success(image) | Self::Cached(image) | Self::Validated(image) => image,
        }
    }

    pub fn into_image(self) -> Image {
        match self {
            Self::Success(image) | Self::Cached(image) | Self::Validated(image) => image,
        }
    }
}

/// Options for a single [`FetchCoordinator::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub cache_strategy: CacheStrategy,
    pub storage: StorageStrategy,
    /// Extra request headers.
    pub headers: RequestHeaders,
    /// Overrides the cache key, which is derived from the URL by default.
    pub key: Option<CacheKey>,
}

/// Decodes response bodies on the blocking thread pool.
#[derive(Debug, Clone)]
pub(crate) struct ImageDecoder {
    codec: Arc<dyn ImageCodec>,
    runtime: Handle,
}

impl ImageDecoder {
    pub(crate) fn new(codec: Arc<dyn ImageCodec>, runtime: Handle) -> Self {
        Self { codec, runtime }
    }

    pub(crate) async fn decode(&self, body: Bytes) -> Result<Image, FetchError> {
        let codec = Arc::clone(&self.codec);
        match self.runtime.spawn_blocking(move || codec.decode(&body)).await {
            Ok(Some(image)) => Ok(image),
            Ok(None) => Err(FetchError::InvalidData),
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, "Image decoding panicked");
                Err(FetchError::Internal)
            }
        }
    }
}

/// The outcome of one network operation, as handed to every caller waiting on it.
#[derive(Debug, Clone)]
struct Fetched {
    result: DownloadResult,
    /// The validator stored alongside the image.
    etag: Option<String>,
    /// The tiers the image was written to.
    storage: StorageStrategy,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Fetched, FetchError>>>;

/// Loads images according to a [`CacheStrategy`], deduplicating concurrent network fetches.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn HttpClient>,
    decoder: ImageDecoder,
    caches: Arc<CacheCoordinator>,
    clock: Arc<dyn Clock>,
    revalidation: RevalidationHandler,
    in_flight: Mutex<HashMap<CacheKey, SharedFetch>>,
    timeout: Duration,
    runtime: Handle,
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("client", &self.inner.client)
            .field("in_flight", &lock(&self.inner.in_flight).len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

struct FetchRequest {
    url: Url,
    key: CacheKey,
    options: FetchOptions,
}

impl FetchCoordinator {
    /// Creates a coordinator.
    ///
    /// `timeout` bounds every network operation, including revalidation and decoding.
    pub fn new(
        client: Arc<dyn HttpClient>,
        codec: Arc<dyn ImageCodec>,
        caches: Arc<CacheCoordinator>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        runtime: Handle,
    ) -> Self {
        let decoder = ImageDecoder::new(codec, runtime.clone());
        let revalidation = RevalidationHandler::new(
            Arc::clone(&client),
            decoder.clone(),
            Arc::clone(&caches),
            Arc::clone(&clock),
        );

        Self {
            inner: Arc::new(Inner {
                client,
                decoder,
                caches,
                clock,
                revalidation,
                in_flight: Mutex::new(HashMap::new()),
                timeout,
                runtime,
            }),
        }
    }

    /// Loads the image at `url`.
    ///
    /// If another fetch for the same key is already on the network, this waits for its result
    /// instead of starting a second request. The image is then written to the tiers selected
    /// by `options` as well. Dropping the returned future does not abort the network operation.
    pub async fn fetch(
        &self,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<DownloadResult, FetchError> {
        validate_url(url)?;
        let key = options
            .key
            .clone()
            .unwrap_or_else(|| CacheKey::from_url(url));

        if options.cache_strategy == CacheStrategy::CacheFirst {
            let cached = self
                .inner
                .caches
                .retrieve_image(&key, options.storage)
                .await;
            if let Some(image) = cached {
                tracing::trace!(key = %key, "Serving image from cache");
                return Ok(DownloadResult::Cached(image));
            }
        }

        let request = FetchRequest {
            url: url.clone(),
            key: key.clone(),
            options: options.clone(),
        };
        let fetched = self.join_or_start(request).await?;

        if fetched.storage != options.storage {
            tracing::trace!(key = %key, "Storing joined fetch into {}", options.storage.as_str());
            let image = fetched.result.image().clone();
            let entry = CacheEntry::new(key, image, fetched.etag, self.inner.clock.now());
            self.inner.caches.store(entry, options.storage);
        }

        Ok(fetched.result)
    }

    /// Returns the fetch in flight for the request's key, starting one if there is none.
    fn join_or_start(&self, request: FetchRequest) -> SharedFetch {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(fetch) = in_flight.get(&request.key) {
            tracing::trace!(key = %request.key, "Joining fetch in flight");
            metric!(counter("fetch.deduplicated") += 1);
            return fetch.clone();
        }

        let key = request.key.clone();
        let this = self.clone();
        let handle = self.inner.runtime.spawn(async move {
            let key = request.key.clone();
            let _release = defer(|| {
                lock(&this.inner.in_flight).remove(&key);
            });

            let start = Instant::now();
            let timeout = this.inner.timeout;
            let result = tokio::time::timeout(timeout, this.fetch_from_network(&request))
                .await
                .unwrap_or(Err(FetchError::Timeout(timeout)));

            metric!(timer("fetch.duration") = start.elapsed());
            if let Err(ref e) = result {
                tracing::debug!(
                    error = e as &dyn std::error::Error,
                    url = %request.url,
                    "Failed to fetch image",
                );
            }
            result
        });

        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = &e as &dyn std::error::Error, "Fetch task failed");
                    Err(FetchError::Internal)
                }
            }
        }
        .boxed()
        .shared();

        in_flight.insert(key, fetch.clone());
        fetch
    }

    async fn fetch_from_network(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        let FetchRequest { url, key, options } = request;
        let headers = header_map(&options.headers);
        let storage = options.storage;

        if options.cache_strategy == CacheStrategy::EtagValidation {
            let cached = self.inner.caches.retrieve_entry(key, options.storage).await;
            if let Some(CacheEntry {
                image,
                etag: Some(etag),
                ..
            }) = cached
            {
                let revalidation = self
                    .inner
                    .revalidation
                    .revalidate(url, key, &headers, image, &etag, storage)
                    .await?;
                return Ok(match revalidation {
                    Revalidation::Reused(image) => Fetched {
                        result: DownloadResult::Validated(image),
                        etag: Some(etag),
                        storage,
                    },
                    Revalidation::Fresh { image, etag } => Fetched {
                        result: DownloadResult::Success(image),
                        etag,
                        storage,
                    },
                });
            }
        }

        self.download(url, key, &headers, storage).await
    }

    /// Unconditionally fetches and decodes the image, and stores it in the caches.
    async fn download(
        &self,
        url: &Url,
        key: &CacheKey,
        headers: &HeaderMap,
        storage: StorageStrategy,
    ) -> Result<Fetched, FetchError> {
        metric!(counter("fetch.network") += 1);
        let response = self.inner.client.get(url, headers).await?;

        if !response.status.is_success() {
            return Err(FetchError::Status(response.status));
        }
        if response.body.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        let etag = response.etag();
        let image = self.inner.decoder.decode(response.body).await?;

        let entry = CacheEntry::new(key.clone(), image.clone(), etag.clone(), self.inner.clock.now());
        self.inner.caches.store(entry, storage);

        Ok(Fetched {
            result: DownloadResult::Success(image),
            etag,
            storage,
        })
    }
}

fn validate_url(url: &Url) -> Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(()),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests;
