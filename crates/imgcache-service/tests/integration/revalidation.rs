use imgcache_service::caching::{CacheKey, StorageStrategy};
use imgcache_service::codec::Image;
use imgcache_service::download::CacheStrategy;
use imgcache_service::service::{ImageService, LoadOptions};
use imgcache_test::ImageServer;
use tokio::runtime::Handle;

use crate::setup_service;

fn validating() -> LoadOptions {
    LoadOptions {
        cache_strategy: CacheStrategy::EtagValidation,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_etag_revalidation() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();
    let url = server.url("image/versioned.png");
    let key = CacheKey::from_url(&url);

    let first = service.load_image(url.clone(), validating()).await.unwrap();
    assert_eq!(first.width(), 16);
    assert_eq!(
        service
            .caches()
            .retrieve_etag(&key, StorageStrategy::Memory)
            .await
            .as_deref(),
        Some("\"v1\"")
    );

    // unchanged: the origin answers 304 and the cached handle is reused
    let second = service.load_image(url.clone(), validating()).await.unwrap();
    assert!(Image::ptr_eq(&first, &second));
    assert_eq!(server.accesses(), 2);

    server.update_image("\"v2\"", 4, 4);
    let third = service.load_image(url.clone(), validating()).await.unwrap();
    assert_eq!((third.width(), third.height()), (4, 4));
    assert_eq!(
        service
            .caches()
            .retrieve_etag(&key, StorageStrategy::Memory)
            .await
            .as_deref(),
        Some("\"v2\"")
    );
}

#[tokio::test]
async fn test_revalidation_from_disk() {
    let (service, cache_dir) = setup_service(|_| ());
    let server = ImageServer::new();
    let url = server.url("image/persisted.png");

    let options = LoadOptions {
        storage_strategy: Some(StorageStrategy::Disk),
        ..validating()
    };
    service.load_image(url.clone(), options.clone()).await.unwrap();
    service.flush().await;
    assert_eq!(server.accesses(), 1);

    // a new service on the same directory starts with an empty memory tier
    let mut config = imgcache_service::config::Config::default();
    config.cache_dir = Some(cache_dir.path().to_owned());
    let service = ImageService::from_config(&config, Handle::current()).unwrap();

    let cached = service
        .load_image(
            url.clone(),
            LoadOptions {
                storage_strategy: Some(StorageStrategy::Disk),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cached.width(), 16);
    assert_eq!(server.accesses(), 0);

    let validated = service.load_image(url, options).await.unwrap();
    assert_eq!(validated.width(), 16);
    assert_eq!(server.all_hits(), vec![("/image/persisted.png".to_owned(), 1)]);
}
