use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::StatusCode;
use reqwest::header::{self, HeaderValue};

use crate::caching::{DiskCache, ExpirationPolicy, MemoryCache};
use crate::codec::RasterCodec;
use crate::test;
use crate::utils::clock::ManualClock;

use super::*;

fn png(width: u32, height: u32) -> Bytes {
    let pixels = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([1, 2, 3])));
    let mut buf = Vec::new();
    pixels
        .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf.into()
}

fn response(status: StatusCode, etag: Option<&str>, body: Bytes) -> HttpResponse {
    let mut headers = HeaderMap::new();
    if let Some(etag) = etag {
        headers.insert(header::ETAG, HeaderValue::from_str(etag).unwrap());
    }
    HttpResponse {
        status,
        headers,
        body,
    }
}

/// Replays canned responses, one per request, and records the requests it saw.
#[derive(Debug, Default)]
struct MockClient {
    responses: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
    requests: Mutex<Vec<HeaderMap>>,
    delay: Duration,
}

impl MockClient {
    fn new(responses: impl IntoIterator<Item = Result<HttpResponse, FetchError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Default::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    fn request(&self, index: usize) -> HeaderMap {
        lock(&self.requests)[index].clone()
    }
}

#[async_trait]
impl HttpClient for MockClient {
    async fn get(&self, _url: &Url, headers: &HeaderMap) -> Result<HttpResponse, FetchError> {
        lock(&self.requests).push(headers.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Transport("no more responses".into())))
    }
}

/// Counts how many images were decoded.
#[derive(Debug, Default)]
struct CountingCodec {
    decodes: AtomicUsize,
}

impl ImageCodec for CountingCodec {
    fn decode(&self, bytes: &[u8]) -> Option<Image> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        RasterCodec.decode(bytes)
    }

    fn encode(&self, image: &Image, quality: u8) -> Option<Vec<u8>> {
        RasterCodec.encode(image, quality)
    }

    fn resize(&self, image: &Image, width: u32, height: u32) -> Option<Image> {
        RasterCodec.resize(image, width, height)
    }

    fn downsample(&self, image: &Image, width: u32, height: u32) -> Option<Image> {
        RasterCodec.downsample(image, width, height)
    }
}

struct Fixture {
    _cache_dir: test::TempDir,
    client: Arc<MockClient>,
    codec: Arc<CountingCodec>,
    caches: Arc<CacheCoordinator>,
    fetcher: FetchCoordinator,
}

fn fixture(client: MockClient) -> Fixture {
    fixture_with_timeout(client, Duration::from_secs(10))
}

fn fixture_with_timeout(client: MockClient, timeout: Duration) -> Fixture {
    test::setup();
    let cache_dir = test::tempdir();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let client = Arc::new(client);
    let codec = Arc::new(CountingCodec::default());

    let memory = MemoryCache::new(10_000_000, clock.clone());
    let disk = DiskCache::new(
        cache_dir.path(),
        10_000_000,
        ExpirationPolicy::Never,
        codec.clone(),
        clock.clone(),
    );
    let caches = Arc::new(CacheCoordinator::new(
        Arc::new(memory),
        Arc::new(disk),
        Handle::current(),
    ));
    let fetcher = FetchCoordinator::new(
        client.clone(),
        codec.clone(),
        caches.clone(),
        clock,
        timeout,
        Handle::current(),
    );

    Fixture {
        _cache_dir: cache_dir,
        client,
        codec,
        caches,
        fetcher,
    }
}

impl Fixture {
    fn decodes(&self) -> usize {
        self.codec.decodes.load(Ordering::SeqCst)
    }
}

fn url() -> Url {
    "https://images.example.com/cat.png".parse().unwrap()
}

fn options(cache_strategy: CacheStrategy) -> FetchOptions {
    FetchOptions {
        cache_strategy,
        storage: StorageStrategy::Memory,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cache_first() {
    let f = fixture(MockClient::new([Ok(response(
        StatusCode::OK,
        None,
        png(8, 4),
    ))]));

    let first = f.fetcher.fetch(&url(), &options(CacheStrategy::CacheFirst)).await;
    assert!(matches!(first, Ok(DownloadResult::Success(_))));

    let second = f
        .fetcher
        .fetch(&url(), &options(CacheStrategy::CacheFirst))
        .await
        .unwrap();
    assert!(matches!(second, DownloadResult::Cached(_)));
    assert_eq!(second.image().width(), 8);
    assert_eq!(f.client.calls(), 1);
}

#[tokio::test]
async fn test_force_download_replaces_cache() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, None, png(8, 4))),
        Ok(response(StatusCode::OK, None, png(3, 3))),
    ]));
    let options = options(CacheStrategy::ForceDownload);

    f.fetcher.fetch(&url(), &options).await.unwrap();
    let second = f.fetcher.fetch(&url(), &options).await.unwrap();
    assert!(matches!(second, DownloadResult::Success(_)));
    assert_eq!(f.client.calls(), 2);

    let cached = f
        .caches
        .retrieve_image(&CacheKey::from_url(&url()), StorageStrategy::Memory)
        .await
        .unwrap();
    assert_eq!(cached.width(), 3);
}

#[tokio::test]
async fn test_etag_reuse() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, Some("\"v1\""), png(8, 4))),
        Ok(response(StatusCode::NOT_MODIFIED, None, Bytes::new())),
    ]));

    let first = f
        .fetcher
        .fetch(&url(), &options(CacheStrategy::ForceDownload))
        .await
        .unwrap();
    assert_eq!(f.decodes(), 1);

    let second = f
        .fetcher
        .fetch(&url(), &options(CacheStrategy::EtagValidation))
        .await
        .unwrap();
    assert!(matches!(second, DownloadResult::Validated(_)));
    assert!(Image::ptr_eq(first.image(), second.image()));
    assert_eq!(f.decodes(), 1);

    assert_eq!(f.client.request(1)[header::IF_NONE_MATCH], "\"v1\"");
}

#[tokio::test]
async fn test_etag_changed() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, Some("\"v1\""), png(8, 4))),
        Ok(response(StatusCode::OK, Some("\"v2\""), png(5, 5))),
    ]));
    let key = CacheKey::from_url(&url());

    f.fetcher
        .fetch(&url(), &options(CacheStrategy::ForceDownload))
        .await
        .unwrap();
    let second = f
        .fetcher
        .fetch(&url(), &options(CacheStrategy::EtagValidation))
        .await
        .unwrap();

    assert!(matches!(second, DownloadResult::Success(_)));
    assert_eq!(second.image().width(), 5);
    let entry = f
        .caches
        .retrieve_entry(&key, StorageStrategy::Memory)
        .await
        .unwrap();
    assert_eq!(entry.etag.as_deref(), Some("\"v2\""));
    assert_eq!(entry.image.width(), 5);
}

#[tokio::test]
async fn test_etag_dropped_by_origin() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, Some("\"v1\""), png(8, 4))),
        Ok(response(StatusCode::OK, None, png(5, 5))),
    ]));
    let key = CacheKey::from_url(&url());
    let options = options(CacheStrategy::EtagValidation);

    f.fetcher.fetch(&url(), &options).await.unwrap();
    let second = f.fetcher.fetch(&url(), &options).await.unwrap();

    assert!(matches!(second, DownloadResult::Success(_)));
    assert_eq!(second.image().width(), 5);
    assert_eq!(
        f.caches.retrieve_etag(&key, StorageStrategy::Memory).await,
        None
    );
    let cached = f
        .caches
        .retrieve_image(&key, StorageStrategy::Memory)
        .await
        .unwrap();
    assert!(Image::ptr_eq(&cached, second.image()));
}

#[tokio::test]
async fn test_etag_changed_to_garbage() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, Some("\"v1\""), png(8, 4))),
        Ok(response(
            StatusCode::OK,
            Some("\"v2\""),
            Bytes::from_static(b"not an image"),
        )),
    ]));
    let key = CacheKey::from_url(&url());
    let options = options(CacheStrategy::EtagValidation);

    let first = f.fetcher.fetch(&url(), &options).await.unwrap();
    let result = f.fetcher.fetch(&url(), &options).await;
    assert_eq!(result.unwrap_err(), FetchError::InvalidData);

    let entry = f
        .caches
        .retrieve_entry(&key, StorageStrategy::Memory)
        .await
        .unwrap();
    assert!(Image::ptr_eq(&entry.image, first.image()));
    assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn test_etag_error_does_not_fall_back() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, Some("\"v1\""), png(8, 4))),
        Ok(response(StatusCode::INTERNAL_SERVER_ERROR, None, Bytes::new())),
        Ok(response(StatusCode::PARTIAL_CONTENT, None, png(8, 4))),
    ]));
    let options = options(CacheStrategy::EtagValidation);

    f.fetcher.fetch(&url(), &options).await.unwrap();

    let result = f.fetcher.fetch(&url(), &options).await;
    assert_eq!(
        result.unwrap_err(),
        FetchError::Status(StatusCode::INTERNAL_SERVER_ERROR)
    );

    let result = f.fetcher.fetch(&url(), &options).await;
    assert!(matches!(result, Err(FetchError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_etag_without_validator() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::OK, None, png(8, 4))),
        Ok(response(StatusCode::OK, None, png(8, 4))),
    ]));
    let options = options(CacheStrategy::EtagValidation);

    f.fetcher.fetch(&url(), &options).await.unwrap();
    let second = f.fetcher.fetch(&url(), &options).await.unwrap();

    assert!(matches!(second, DownloadResult::Success(_)));
    assert!(!f.client.request(1).contains_key(header::IF_NONE_MATCH));
}

#[tokio::test]
async fn test_deduplication() {
    let client = MockClient::new([Ok(response(StatusCode::OK, None, png(8, 4)))])
        .with_delay(Duration::from_millis(100));
    let f = fixture(client);
    let options = options(CacheStrategy::ForceDownload);

    let url = url();
    let results =
        futures::future::join_all((0..10).map(|_| f.fetcher.fetch(&url, &options))).await;

    assert_eq!(f.client.calls(), 1);
    assert_eq!(f.decodes(), 1);
    let first = results[0].as_ref().unwrap().image();
    for result in &results {
        assert!(Image::ptr_eq(result.as_ref().unwrap().image(), first));
    }
}

#[tokio::test]
async fn test_deduplication_stores_into_each_strategy() {
    let client = MockClient::new([Ok(response(StatusCode::OK, Some("\"v1\""), png(8, 4)))])
        .with_delay(Duration::from_millis(100));
    let f = fixture(client);
    let key = CacheKey::from_url(&url());

    let memory = FetchOptions {
        cache_strategy: CacheStrategy::ForceDownload,
        storage: StorageStrategy::Memory,
        ..Default::default()
    };
    let disk = FetchOptions {
        storage: StorageStrategy::Disk,
        ..memory.clone()
    };

    let url = url();
    let (first, second) =
        futures::future::join(f.fetcher.fetch(&url, &memory), f.fetcher.fetch(&url, &disk)).await;
    assert!(Image::ptr_eq(first.unwrap().image(), second.unwrap().image()));
    assert_eq!(f.client.calls(), 1);

    f.caches.flush().await;
    let on_disk = f
        .caches
        .retrieve_entry(&key, StorageStrategy::Disk)
        .await
        .unwrap();
    assert_eq!(on_disk.image.width(), 8);
    assert_eq!(on_disk.etag.as_deref(), Some("\"v1\""));
    assert!(
        f.caches
            .retrieve_image(&key, StorageStrategy::Memory)
            .await
            .is_some()
    );
}

#[tokio::test]
async fn test_failures_release_registration() {
    let f = fixture(MockClient::new([
        Ok(response(StatusCode::NOT_FOUND, None, Bytes::new())),
        Err(FetchError::Transport("connection reset".into())),
        Ok(response(StatusCode::OK, None, Bytes::new())),
        Ok(response(StatusCode::OK, None, Bytes::from_static(b"garbage"))),
        Ok(response(StatusCode::OK, None, png(2, 2))),
    ]));
    let options = options(CacheStrategy::CacheFirst);

    let expected = [
        FetchError::Status(StatusCode::NOT_FOUND),
        FetchError::Transport("connection reset".into()),
        FetchError::EmptyBody,
        FetchError::InvalidData,
    ];
    for error in expected {
        assert_eq!(f.fetcher.fetch(&url(), &options).await.unwrap_err(), error);
    }

    let result = f.fetcher.fetch(&url(), &options).await.unwrap();
    assert!(matches!(result, DownloadResult::Success(_)));
    assert_eq!(f.client.calls(), 5);
}

#[tokio::test]
async fn test_invalid_url() {
    let f = fixture(MockClient::default());

    let url: Url = "ftp://images.example.com/cat.png".parse().unwrap();
    let result = f
        .fetcher
        .fetch(&url, &options(CacheStrategy::CacheFirst))
        .await;

    assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    assert_eq!(f.client.calls(), 0);
}

#[tokio::test]
async fn test_timeout() {
    let client = MockClient::new([Ok(response(StatusCode::OK, None, png(2, 2)))])
        .with_delay(Duration::from_secs(5));
    let f = fixture_with_timeout(client, Duration::from_millis(50));

    let result = f
        .fetcher
        .fetch(&url(), &options(CacheStrategy::CacheFirst))
        .await;
    assert_eq!(
        result.unwrap_err(),
        FetchError::Timeout(Duration::from_millis(50))
    );
}

#[tokio::test]
async fn test_request_headers_and_key_override() {
    let f = fixture(MockClient::new([Ok(response(
        StatusCode::OK,
        None,
        png(2, 2),
    ))]));
    let key = CacheKey::new("avatar:42");
    let mut options = options(CacheStrategy::CacheFirst);
    options.key = Some(key.clone());
    options
        .headers
        .insert("Authorization".into(), "Bearer token".into());

    f.fetcher.fetch(&url(), &options).await.unwrap();

    assert_eq!(f.client.request(0)["authorization"], "Bearer token");
    assert!(
        f.caches
            .retrieve_image(&key, StorageStrategy::Memory)
            .await
            .is_some()
    );
    assert!(
        f.caches
            .retrieve_image(&CacheKey::from_url(&url()), StorageStrategy::Memory)
            .await
            .is_none()
    );
}
