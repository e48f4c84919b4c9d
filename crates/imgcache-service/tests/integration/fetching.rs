use std::time::Duration;

use imgcache_service::caching::StorageStrategy;
use imgcache_service::codec::Image;
use imgcache_service::download::{CacheStrategy, FetchError};
use imgcache_service::service::LoadOptions;
use imgcache_test::ImageServer;
use reqwest::StatusCode;

use crate::{setup_service, setup_service_with_slow_client};

#[tokio::test]
async fn test_load_over_http() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();
    let url = server.url("image/cat.png");

    let image = service
        .load_image(url.clone(), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!((image.width(), image.height()), (16, 8));
    assert_eq!(server.accesses(), 1);

    let cached = service
        .load_image(url, LoadOptions::default())
        .await
        .unwrap();
    assert!(Image::ptr_eq(&image, &cached));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_concurrent_loads_share_a_request() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();
    let url = server.url("delay/100ms/image/shared.png");

    let options = LoadOptions {
        cache_strategy: CacheStrategy::ForceDownload,
        ..Default::default()
    };
    let tasks: Vec<_> = (0..10)
        .map(|_| service.load_image(url.clone(), options.clone()))
        .collect();
    let images = futures::future::join_all(tasks).await;

    for image in &images {
        let image = image.as_ref().unwrap();
        assert!(Image::ptr_eq(image, images[0].as_ref().unwrap()));
    }
    assert_eq!(
        server.all_hits(),
        vec![
            ("/delay/100ms/image/shared.png".to_owned(), 1),
            ("/image/shared.png".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn test_download_errors() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();

    let load = |path: &str| service.load_image(server.url(path), LoadOptions::default());

    assert_eq!(
        load("respond_statuscode/404/missing.png").await.unwrap_err(),
        FetchError::Status(StatusCode::NOT_FOUND)
    );
    assert_eq!(
        load("respond_statuscode/500/broken.png").await.unwrap_err(),
        FetchError::Status(StatusCode::INTERNAL_SERVER_ERROR)
    );
    assert_eq!(
        load("garbage_data/not_an_image").await.unwrap_err(),
        FetchError::InvalidData
    );
    assert_eq!(
        load("empty/nothing.png").await.unwrap_err(),
        FetchError::EmptyBody
    );

    // failures are not cached
    load("respond_statuscode/404/missing.png").await.unwrap_err();
    assert_eq!(server.accesses(), 5);
}

#[tokio::test]
async fn test_download_timeout() {
    let (service, _cache_dir) = setup_service_with_slow_client(|config| {
        config.max_download_timeout = Duration::from_millis(100);
    });
    let server = ImageServer::new();

    let result = service
        .load_image(server.url("delay/2s/image/slow.png"), LoadOptions::default())
        .await;
    assert_eq!(
        result.unwrap_err(),
        FetchError::Timeout(Duration::from_millis(100))
    );
}

#[tokio::test]
async fn test_cancelled_load_still_populates_cache() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();
    let url = server.url("delay/200ms/image/cancelled.png");

    let task = service.load_image(url.clone(), LoadOptions::default());
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.cancel();
    assert_eq!(task.await.unwrap_err(), FetchError::Cancelled);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let cached = service.cached_image(&url).await.unwrap();
    assert_eq!(cached.width(), 16);
}

#[tokio::test]
async fn test_transparent_images_survive_disk() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();
    let url = server.url("alpha/glass.png");

    let options = LoadOptions {
        storage_strategy: Some(StorageStrategy::Disk),
        ..Default::default()
    };
    service.load_image(url.clone(), options.clone()).await.unwrap();
    service.flush().await;
    assert_eq!(server.accesses(), 1);

    let image = service.load_image(url, options).await.unwrap();
    assert!(image.as_dynamic().color().has_alpha());
    assert_eq!(server.accesses(), 0);
}
