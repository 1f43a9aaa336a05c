//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let cache_dir = jsonkeep_test::tempdir();`.
//!
//!  - When using a [`Server`] or an [`Origin`], make sure it is held until all requests to it
//!    have been made. Dropping it stops serving.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{self, Request, State};
use axum::http::{StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `jsonkeep` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("jsonkeep=trace,jsonkeep_service=trace"))
        .with_target(false)
        .pretty()
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
    /// Serves the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
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

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
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

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

async fn count_hits(State(hits): State<Hits>, request: Request, next: Next) -> Response {
    {
        let mut hits = hits.lock().unwrap();
        *hits.entry(request.uri().to_string()).or_default() += 1;
    }
    next.run(request).await
}

/// Responds with a JSON document naming the requested path and query.
async fn document(uri: Uri) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "path": uri.to_string() }))
}

/// An upstream origin that counts the requests it receives.
///
/// Every path responds with the JSON document `{"path": "<path and query>"}`, except for:
///
///  - `/text/*`: a plain text response.
///  - `/slow/:time/*`: the JSON document, after waiting for a human readable duration.
///  - `/broken/*`: a JSON response whose body fails after the first chunk.
///  - `/status/:num/*`: a JSON error document with the given status code.
pub struct Origin {
    server: Server,
    hits: Hits,
}

impl Origin {
    pub fn new() -> Self {
        let hits = Hits::default();

        let router = Router::new()
            .route("/text/*tail", get(|| async { "this is not json" }))
            .route(
                "/slow/:time/*tail",
                get(
                    |extract::Path((time, _)): extract::Path<(String, String)>, uri: Uri| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        document(uri).await
                    },
                ),
            )
            .route(
                "/broken/*tail",
                get(|| async {
                    let chunks = futures::stream::iter([true, false]).then(|first| async move {
                        if first {
                            Ok(Bytes::from_static(br#"{"partial":"#))
                        } else {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(io::Error::other("upstream broke"))
                        }
                    });
                    (
                        [(header::CONTENT_TYPE, "application/json")],
                        Body::from_stream(chunks),
                    )
                }),
            )
            .route(
                "/status/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        let status =
                            StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        (status, Json(serde_json::json!({ "status": num }))).into_response()
                    },
                ),
            )
            .fallback(document)
            .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The number of requests received for a path, including its query string.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or_default()
    }

    /// The number of requests received in total.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}
