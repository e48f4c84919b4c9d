use std::sync::Arc;

use imgcache_service::codec::RasterCodec;
use imgcache_service::config::Config;
use imgcache_service::download::{DownloadTimeouts, ReqwestClient, create_client};
use imgcache_service::service::ImageService;
use imgcache_test as test;
use tokio::runtime::Handle;

mod fetching;
mod revalidation;

/// Creates an [`ImageService`] backed by a fresh cache directory.
///
/// The returned [`test::TempDir`] must be held for the duration of the test.
pub fn setup_service(update_config: impl FnOnce(&mut Config)) -> (ImageService, test::TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    update_config(&mut config);

    let service = ImageService::from_config(&config, Handle::current()).unwrap();
    (service, cache_dir)
}

/// Like [`setup_service`], but with an HTTP client that never times out on its own.
///
/// Only the fetch timeout from the config applies.
pub fn setup_service_with_slow_client(
    update_config: impl FnOnce(&mut Config),
) -> (ImageService, test::TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    update_config(&mut config);

    let client = create_client(&DownloadTimeouts::default(), &config.user_agent).unwrap();
    let service = ImageService::new(
        &config,
        Arc::new(ReqwestClient::new(client)),
        Arc::new(RasterCodec),
        Handle::current(),
    );
    (service, cache_dir)
}
