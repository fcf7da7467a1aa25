//! Helpers for testing the service and the command line client.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The directory is deleted as soon as the handle is dropped.
//!
//!  - When using a [`HitCounter`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, all connections to it fail.
//!
//!  - Fixtures served under `/fixtures/` may contain the placeholder `%BASE%`, which is replaced
//!    with the base URL of the serving test server (without a trailing slash). This allows
//!    fixtures to link to each other.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{self, Request};
use axum::middleware::{self, Next};
use axum::routing::get;
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the coalesce crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalesce_service=trace,quakecli=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// The `tests/fixtures` directory, located from the workspace root.
fn fixtures_dir() -> PathBuf {
    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.pop(); // to /crates/
    full_path.pop(); // to /
    full_path.push("tests/fixtures/");
    full_path
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
    /// Starts a test server, building its router from the server's base URL.
    pub fn with_router<F>(make_router: F) -> Self
    where
        F: FnOnce(&Url) -> Router,
    {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let base = format!("http://{socket}/").parse().unwrap();
        let router = make_router(&base);

        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.addr(), path).parse().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A test server that counts the requests it receives per path.
///
/// It serves the following routes:
///
///  - `/fixtures/*path`: The fixture at `path`, or a 404 if it does not exist.
///  - `/delay/:time/*path`: Waits for `time` (like `100ms`), then redirects to `/path`.
///  - `/respond_statuscode/:num/*tail`: Responds with an empty body and the status code `num`.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let server = Server::with_router(|base| {
            let base = base.as_str().trim_end_matches('/').to_owned();

            Router::new()
                .route(
                    "/fixtures/*path",
                    get(move |extract::Path(path): extract::Path<String>| {
                        let base = base.clone();
                        async move {
                            std::fs::read_to_string(fixtures_dir().join(path))
                                .map(|contents| contents.replace("%BASE%", &base))
                                .map_err(|_| StatusCode::NOT_FOUND)
                        }
                    }),
                )
                .route(
                    "/delay/:time/*path",
                    get(
                        |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                            let duration = humantime::parse_duration(&time).unwrap();
                            tokio::time::sleep(duration).await;

                            (StatusCode::FOUND, [("Location", format!("/{}", path))])
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
                .layer(middleware::from_fn(hitcounter))
        });

        Self { server, hits }
    }

    /// Returns the number of requests for `path` since the server started.
    pub fn hits(&self, path: &str) -> usize {
        let path = format!("/{}", path.trim_start_matches('/'));
        self.hits.lock().unwrap().get(&path).copied().unwrap_or_default()
    }

    /// Returns the total number of requests, and resets all counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
