//! Helpers for testing the image service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], hold the handle to the temp directory for the entire lifetime of
//!    the test. The disk cache recreates its directories lazily, so dropping the handle early
//!    may silently leak the directory. Assign it to a variable in the test function (e.g.
//!    `let cache_dir = test::tempdir()`).
//!
//!  - When using [`ImageServer`], hold the server until all requests to it have been made.
//!    Once it is dropped, connections to its port are refused.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{self, OriginalUri, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `imgcache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("imgcache_service=trace,imgcache=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Encodes an opaque, single colored PNG of the given size.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
    encode_png(DynamicImage::ImageRgb8(pixels))
}

/// Encodes a half transparent PNG of the given size.
pub fn alpha_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 128]));
    encode_png(DynamicImage::ImageRgba8(pixels))
}

fn encode_png(pixels: DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    pixels
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves `router` on an ephemeral port of the loopback interface.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The representation currently served by the `/image` routes.
#[derive(Debug, Clone)]
struct Version {
    etag: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone)]
struct ServerState {
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    version: Arc<Mutex<Version>>,
}

/// An HTTP image origin that counts the requests it receives.
///
/// Routes:
///
///  - `/image/*` serves a PNG with an `ETag`, and honors `If-None-Match` with `304`.
///  - `/alpha/*` serves a transparent PNG without a validator.
///  - `/delay/:time/*path` waits for a [`humantime`] duration, then redirects to `/path`.
///  - `/respond_statuscode/:num/*` responds with an empty body and the given status.
///  - `/garbage_data/*` responds with the tail of the path as body.
///  - `/empty/*` responds with `200` and an empty body.
pub struct ImageServer {
    server: Server,
    state: ServerState,
}

impl ImageServer {
    pub fn new() -> Self {
        let state = ServerState {
            hits: Arc::new(Mutex::new(BTreeMap::new())),
            version: Arc::new(Mutex::new(Version {
                etag: "\"v1\"".into(),
                width: 16,
                height: 8,
            })),
        };

        let router = Router::new()
            .route("/image/*tail", get(serve_image))
            .route(
                "/alpha/*tail",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], alpha_png_bytes(8, 8)) }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route("/empty/*tail", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Changes the image served by the `/image` routes, along with its validator.
    pub fn update_image(&self, etag: &str, width: u32, height: u32) {
        *self.state.version.lock().unwrap() = Version {
            etag: etag.into(),
            width,
            height,
        };
    }

    /// Returns and resets the number of requests received.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the requests received, per URI.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn count_hits(
    State(state): State<ServerState>,
    OriginalUri(uri): OriginalUri,
    request: Request,
    next: Next,
) -> Response {
    {
        let mut hits = state.hits.lock().unwrap();
        *hits.entry(uri.to_string()).or_default() += 1;
    }

    next.run(request).await
}

async fn serve_image(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let version = state.version.lock().unwrap().clone();

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == version.etag);
    if not_modified {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, version.etag)]).into_response();
    }

    let body = png_bytes(version.width, version.height);
    (
        [
            (header::CONTENT_TYPE, "image/png".to_owned()),
            (header::ETAG, version.etag),
        ],
        body,
    )
        .into_response()
}
