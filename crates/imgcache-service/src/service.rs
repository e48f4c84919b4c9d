//! The public entry point for loading images.
//!
//! An [`ImageService`] wires the cache tiers and the fetch machinery together. It is created
//! explicitly and shared by the caller, usually behind an `Arc`.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caching::{CacheCoordinator, CacheKey, CleanupStats, StorageStrategy};
use crate::codec::{Image, ImageCodec, ImageProcessing, RasterCodec};
use crate::config::Config;
use crate::download::{
    CacheStrategy, FetchCoordinator, FetchError, FetchOptions, HttpClient, ReqwestClient,
    RequestHeaders,
};
use crate::utils::clock::{Clock, SystemClock};

/// Per request options for [`ImageService::load_image`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Extra request headers, for example for authorization.
    pub headers: RequestHeaders,
    pub cache_strategy: CacheStrategy,
    /// The tiers to use. Defaults to the configured storage strategy.
    pub storage_strategy: Option<StorageStrategy>,
    /// Applied to the image after it was loaded.
    pub processing: ImageProcessing,
}

/// Loads, caches and processes images.
#[derive(Debug, Clone)]
pub struct ImageService {
    caches: Arc<CacheCoordinator>,
    fetcher: FetchCoordinator,
    codec: Arc<dyn ImageCodec>,
    default_storage: StorageStrategy,
    runtime: Handle,
}

impl ImageService {
    /// Creates a service using the given transport and codec.
    ///
    /// All background work (network, decoding and disk I/O) is spawned onto `runtime`.
    pub fn new(
        config: &Config,
        http_client: Arc<dyn HttpClient>,
        codec: Arc<dyn ImageCodec>,
        runtime: Handle,
    ) -> Self {
        Self::with_clock(config, http_client, codec, Arc::new(SystemClock), runtime)
    }

    /// Creates a service using the default `reqwest` transport and [`RasterCodec`].
    pub fn from_config(config: &Config, runtime: Handle) -> Result<Self, FetchError> {
        let client = ReqwestClient::from_config(config)?;
        Ok(Self::new(
            config,
            Arc::new(client),
            Arc::new(RasterCodec),
            runtime,
        ))
    }

    /// Like [`ImageService::new`], with a custom source of time.
    pub fn with_clock(
        config: &Config,
        http_client: Arc<dyn HttpClient>,
        codec: Arc<dyn ImageCodec>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        let caches = Arc::new(CacheCoordinator::from_config(
            config,
            Arc::clone(&codec),
            Arc::clone(&clock),
            runtime.clone(),
        ));
        let fetcher = FetchCoordinator::new(
            http_client,
            Arc::clone(&codec),
            Arc::clone(&caches),
            clock,
            config.max_download_timeout,
            runtime.clone(),
        );

        Self {
            caches,
            fetcher,
            codec,
            default_storage: config.caches.default_storage,
            runtime,
        }
    }

    pub fn caches(&self) -> &CacheCoordinator {
        &self.caches
    }

    /// Starts loading the image at `url`.
    ///
    /// The load makes progress on its own. Awaiting the returned [`LoadTask`] yields the image,
    /// and [`LoadTask::cancel`] abandons it.
    pub fn load_image(&self, url: Url, options: LoadOptions) -> LoadTask {
        let LoadOptions {
            headers,
            cache_strategy,
            storage_strategy,
            processing,
        } = options;
        let fetch_options = FetchOptions {
            cache_strategy,
            storage: storage_strategy.unwrap_or(self.default_storage),
            headers,
            key: None,
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let fetcher = self.fetcher.clone();
        let codec = Arc::clone(&self.codec);
        let runtime = self.runtime.clone();
        let task_url = url.clone();

        let handle = self.runtime.spawn(async move {
            let load = async {
                let result = fetcher.fetch(&task_url, &fetch_options).await?;
                Ok(process(result.into_image(), processing, codec, runtime).await)
            };

            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    tracing::trace!(url = %task_url, "Image load cancelled");
                    Err(FetchError::Cancelled)
                }
                result = load => result,
            }
        });

        LoadTask { url, token, handle }
    }

    /// Returns the cached image for `url` from the configured tiers, without network access.
    pub async fn cached_image(&self, url: &Url) -> Option<Image> {
        self.caches
            .retrieve_image(&CacheKey::from_url(url), self.default_storage)
            .await
    }

    pub fn clear_cache(&self, strategy: StorageStrategy) {
        self.caches.clear(strategy);
    }

    pub fn remove_cache(&self, url: &Url, strategy: StorageStrategy) {
        self.caches.remove(&CacheKey::from_url(url), strategy);
    }

    /// Drops part of the memory tier in response to memory pressure.
    pub fn reclaim_memory(&self) -> usize {
        let removed = self.caches.reclaim_memory();
        tracing::debug!(removed, "Reclaimed memory cache entries");
        removed
    }

    /// Waits for pending background disk writes.
    pub async fn flush(&self) {
        self.caches.flush().await;
    }

    /// Removes stale and stray files from the disk tier.
    pub async fn cleanup(&self) -> io::Result<CleanupStats> {
        self.caches.cleanup().await
    }
}

/// Applies `processing` on the blocking pool, falling back to the unprocessed image.
async fn process(
    image: Image,
    processing: ImageProcessing,
    codec: Arc<dyn ImageCodec>,
    runtime: Handle,
) -> Image {
    if processing == ImageProcessing::None {
        return image;
    }

    let original = image.clone();
    let processed = runtime
        .spawn_blocking(move || codec.process(&image, processing))
        .await;
    match processed {
        Ok(Some(image)) => image,
        Ok(None) => {
            tracing::warn!(?processing, "Failed to process image, using the original");
            original
        }
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                ?processing,
                "Image processing panicked, using the original",
            );
            original
        }
    }
}

/// A running image load, started by [`ImageService::load_image`].
///
/// Resolves to the loaded image. Dropping the task detaches it: the load keeps running and
/// still populates the caches.
#[derive(Debug)]
pub struct LoadTask {
    url: Url,
    token: CancellationToken,
    handle: JoinHandle<Result<Image, FetchError>>,
}

impl LoadTask {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Abandons the load. Awaiting the task afterwards yields [`FetchError::Cancelled`].
    ///
    /// A network operation that is already running is not interrupted, as other loads of the
    /// same image may be waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that cancels this load from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Future for LoadTask {
    type Output = Result<Image, FetchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(FetchError::Cancelled));
        }

        let result = ready!(Pin::new(&mut self.handle).poll(cx));
        if self.token.is_cancelled() {
            return Poll::Ready(Err(FetchError::Cancelled));
        }

        Poll::Ready(result.unwrap_or_else(|e| {
            tracing::error!(error = &e as &dyn std::error::Error, "Image load task failed");
            Err(FetchError::Internal)
        }))
    }
}
