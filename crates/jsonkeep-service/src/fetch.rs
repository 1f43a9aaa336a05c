//! Fetching of upstream documents.
//!
//! A fetch is always run by the holder of a [`FetchLease`]. The [`Fetcher`] downloads the path
//! from the upstream, hands the document to the [`PersistQueue`] and reports the outcome through
//! the lease. A client that is waiting for the fetch can attach a [`LiveSink`] to receive the
//! document while it is being downloaded.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::keep::{FetchLease, Refresher};
use crate::metric;
use crate::store::PersistQueue;
use crate::utils::http::media_type;

/// The reason sent to live clients when the upstream does not respond with JSON.
pub const NOT_JSON: &str = "Endpoint does not return JSON";

/// Errors that leave a fetch without a document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid upstream url")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to reach the upstream")]
    Transport(#[from] reqwest::Error),
    #[error("upstream responded with content type `{0}`")]
    NotJson(String),
    #[error("failed to read the upstream response")]
    Copy(#[source] reqwest::Error),
}

impl FetchError {
    /// A short name of the error kind, for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::Transport(_) => "transport",
            FetchError::NotJson(_) => "not_json",
            FetchError::Copy(_) => "copy",
        }
    }
}

/// The start of the response sent to a live client.
#[derive(Debug)]
pub enum LiveHead {
    /// The upstream responded with JSON, the document follows in the body.
    Stream(LiveBody),
    /// The upstream response can not be served, with a reason for the client.
    Rejected(&'static str),
}

/// The document as it is downloaded, chunk by chunk.
#[derive(Debug)]
pub struct LiveBody {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
}

impl Stream for LiveBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// The receiving end of a live fetch, held by the client facing handler.
#[derive(Debug)]
pub struct LiveResponse {
    head: oneshot::Receiver<LiveHead>,
}

impl LiveResponse {
    /// Waits for the start of the upstream response.
    ///
    /// Returns `None` if the fetch failed before the upstream produced a response.
    pub async fn head(self) -> Option<LiveHead> {
        self.head.await.ok()
    }
}

/// The sending end of a live fetch, passed to [`Fetcher::fetch`].
#[derive(Debug)]
pub struct LiveSink {
    head: oneshot::Sender<LiveHead>,
}

impl LiveSink {
    fn start(self) -> BodySink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.head.send(LiveHead::Stream(LiveBody { rx })).ok();
        BodySink { tx }
    }

    fn reject(self, reason: &'static str) {
        self.head.send(LiveHead::Rejected(reason)).ok();
    }
}

struct BodySink {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
}

impl BodySink {
    /// Forwards a chunk, returns `false` once the client is gone.
    fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).is_ok()
    }

    /// Terminates the body with an error, so the client never sees a truncated document as
    /// complete.
    fn abort(self) {
        let err = io::Error::other("failed to read the upstream response");
        self.tx.send(Err(err)).ok();
    }
}

/// Creates a connected [`LiveSink`] and [`LiveResponse`].
pub fn live_channel() -> (LiveSink, LiveResponse) {
    let (tx, rx) = oneshot::channel();
    (LiveSink { head: tx }, LiveResponse { head: rx })
}

/// Downloads documents from the upstream.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    upstream: Url,
    persist: PersistQueue,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, upstream: Url, persist: PersistQueue) -> Self {
        Self {
            client,
            upstream,
            persist,
        }
    }

    /// The upstream url of a path.
    ///
    /// The path, including its query string, is appended to the upstream url as is.
    pub fn url(&self, path: &str) -> Result<Url, FetchError> {
        let base = self.upstream.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path}"))?)
    }

    /// Fetches the leased path, and completes the lease with the result.
    ///
    /// A fetched document is written to the cache store in the background.
    pub async fn fetch(
        &self,
        lease: FetchLease,
        sink: Option<LiveSink>,
    ) -> Result<Bytes, FetchError> {
        let trigger = if sink.is_some() { "live" } else { "refresh" };
        let start = Instant::now();

        let result = self.download(lease.path(), sink).await;
        match &result {
            Ok(data) => {
                tracing::debug!(path = lease.path(), bytes = data.len(), "Fetched document");
                self.persist.persist(lease.path(), data.clone());
                metric!(
                    counter("keep.fetch") += 1,
                    "status" => "ok",
                    "trigger" => trigger,
                );
            }
            Err(err) => {
                tracing::warn!(
                    error = err as &dyn std::error::Error,
                    path = lease.path(),
                    "Failed to fetch document",
                );
                metric!(
                    counter("keep.fetch") += 1,
                    "status" => err.kind(),
                    "trigger" => trigger,
                );
            }
        }
        metric!(timer("keep.fetch.duration") = start.elapsed(), "trigger" => trigger);

        lease.complete(result.as_ref().ok().cloned());
        result
    }

    /// Downloads `path`, forwarding chunks to the live client as they arrive.
    ///
    /// Only `application/json` responses are accepted. The media type is compared ignoring
    /// ASCII case, and parameters such as `charset` are ignored.
    async fn download(&self, path: &str, sink: Option<LiveSink>) -> Result<Bytes, FetchError> {
        let url = self.url(path)?;
        tracing::trace!("Fetching `{}`", url);
        let response = self.client.get(url).send().await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !media_type(content_type).eq_ignore_ascii_case("application/json") {
            let content_type = content_type.to_owned();
            if let Some(sink) = sink {
                sink.reject(NOT_JSON);
            }
            return Err(FetchError::NotJson(content_type));
        }

        let mut body = sink.map(LiveSink::start);
        let mut buffer = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    if let Some(body) = body {
                        body.abort();
                    }
                    return Err(FetchError::Copy(err));
                }
            };
            buffer.extend_from_slice(&chunk);
            if body.as_ref().is_some_and(|body| !body.send(chunk)) {
                // the document is still needed by the cache and all waiters
                tracing::debug!(path, "Live client went away");
                body = None;
            }
        }

        Ok(buffer.freeze())
    }
}

impl Refresher for Fetcher {
    fn refresh(&self, lease: FetchLease) {
        let fetcher = self.clone();
        let future = async move {
            // failures are logged by `fetch`, the next refresh retries
            fetcher.fetch(lease, None).await.ok();
        };
        tokio::spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use jsonkeep_test::Origin;

    use super::*;
    use crate::keep::{Fetching, Keep};
    use crate::store::{CacheStore, MemoryStore};
    use crate::test::BrokenStore;

    /// Never refreshes anything, the tests lead all fetches themselves.
    struct NoRefresh;

    impl Refresher for NoRefresh {
        fn refresh(&self, _lease: FetchLease) {}
    }

    fn setup(origin: &Origin) -> (Keep, Fetcher, Arc<dyn CacheStore>) {
        jsonkeep_test::setup();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let persist = PersistQueue::new(store.clone(), 10, 2);
        let fetcher = Fetcher::new(reqwest::Client::new(), origin.url("/"), persist);
        let keep = Keep::spawn(Duration::from_secs(3600), NoRefresh);
        (keep, fetcher, store)
    }

    async fn lead(keep: &Keep, path: &str) -> FetchLease {
        match keep.fetching(path).await.unwrap() {
            Fetching::Lead(lease) => lease,
            other => panic!("expected to lead, got {other:?}"),
        }
    }

    async fn stored(store: &Arc<dyn CacheStore>, path: &str) -> Bytes {
        for _ in 0..100 {
            if let Some(data) = store.get(path).await.unwrap() {
                return data;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{path} was never stored");
    }

    #[tokio::test]
    async fn test_url() {
        let persist = PersistQueue::new(Arc::new(MemoryStore::new()), 1, 1);
        let upstream = Url::parse("http://localhost:8085/api/").unwrap();
        let fetcher = Fetcher::new(reqwest::Client::new(), upstream, persist);

        assert_eq!(
            fetcher.url("/users?page=2").unwrap().as_str(),
            "http://localhost:8085/api/users?page=2"
        );
    }

    #[tokio::test]
    async fn test_fetch_json() {
        let origin = Origin::new();
        let (keep, fetcher, store) = setup(&origin);

        let lease = lead(&keep, "/users?page=2").await;
        let follower = tokio::spawn({
            let keep = keep.clone();
            async move { keep.fetching("/users?page=2").await.unwrap() }
        });
        while keep.entries().await.unwrap()[0].waiters < 1 {
            tokio::task::yield_now().await;
        }

        let data = fetcher.fetch(lease, None).await.unwrap();
        assert_eq!(data, r#"{"path":"/users?page=2"}"#);

        match follower.await.unwrap() {
            Fetching::Data(shared) => assert_eq!(shared, data),
            other => panic!("unexpected answer {other:?}"),
        }
        assert_eq!(stored(&store, "/users?page=2").await, data);
        assert_eq!(origin.hits("/users?page=2"), 1);
    }

    #[tokio::test]
    async fn test_fetch_broken_store() {
        jsonkeep_test::setup();
        let origin = Origin::new();
        let persist = PersistQueue::new(Arc::new(BrokenStore), 10, 2);
        let fetcher = Fetcher::new(reqwest::Client::new(), origin.url("/"), persist);
        let keep = Keep::spawn(Duration::from_secs(3600), NoRefresh);

        let lease = lead(&keep, "/a").await;
        let follower = tokio::spawn({
            let keep = keep.clone();
            async move { keep.fetching("/a").await.unwrap() }
        });
        while keep.entries().await.unwrap()[0].waiters < 1 {
            tokio::task::yield_now().await;
        }

        // a failing store never fails the fetch or its waiters
        let data = fetcher.fetch(lease, None).await.unwrap();
        match follower.await.unwrap() {
            Fetching::Data(shared) => assert_eq!(shared, data),
            other => panic!("unexpected answer {other:?}"),
        }

        // the lease was released
        assert!(matches!(
            keep.fetching("/a").await.unwrap(),
            Fetching::Lead(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_live() {
        let origin = Origin::new();
        let (keep, fetcher, _store) = setup(&origin);

        let lease = lead(&keep, "/a").await;
        let (sink, response) = live_channel();
        let data = fetcher.fetch(lease, Some(sink)).await.unwrap();

        let Some(LiveHead::Stream(body)) = response.head().await else {
            panic!("expected a streamed response");
        };
        let chunks: Vec<_> = body.collect().await;
        let streamed: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap())
            .collect();
        assert_eq!(streamed, &data[..]);
    }

    #[tokio::test]
    async fn test_fetch_live_client_gone() {
        let origin = Origin::new();
        let (keep, fetcher, store) = setup(&origin);

        let lease = lead(&keep, "/a").await;
        let (sink, response) = live_channel();
        drop(response);

        let data = fetcher.fetch(lease, Some(sink)).await.unwrap();
        assert_eq!(stored(&store, "/a").await, data);
    }

    #[tokio::test]
    async fn test_fetch_not_json() {
        let origin = Origin::new();
        let (keep, fetcher, store) = setup(&origin);

        let lease = lead(&keep, "/text/a").await;
        let (sink, response) = live_channel();
        let err = fetcher.fetch(lease, Some(sink)).await.unwrap_err();
        assert!(matches!(err, FetchError::NotJson(ref ty) if ty.starts_with("text/plain")));

        assert!(matches!(
            response.head().await,
            Some(LiveHead::Rejected(NOT_JSON))
        ));
        assert_eq!(store.get("/text/a").await.unwrap(), None);
        assert_eq!(origin.accesses(), 1);

        // the lease was released
        assert!(matches!(
            keep.fetching("/text/a").await.unwrap(),
            Fetching::Lead(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_broken_body() {
        let origin = Origin::new();
        let (keep, fetcher, _store) = setup(&origin);

        let lease = lead(&keep, "/broken/a").await;
        let (sink, response) = live_channel();
        let err = fetcher.fetch(lease, Some(sink)).await.unwrap_err();
        assert!(matches!(err, FetchError::Copy(_)));

        let Some(LiveHead::Stream(body)) = response.head().await else {
            panic!("expected a streamed response");
        };
        let chunks: Vec<_> = body.collect().await;
        assert!(chunks.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_fetch_unreachable() {
        jsonkeep_test::setup();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let persist = PersistQueue::new(store, 10, 2);
        // nothing listens on the discard port
        let upstream = Url::parse("http://127.0.0.1:9/").unwrap();
        let fetcher = Fetcher::new(reqwest::Client::new(), upstream, persist);
        let keep = Keep::spawn(Duration::from_secs(3600), NoRefresh);

        let lease = lead(&keep, "/a").await;
        let (sink, response) = live_channel();
        let err = fetcher.fetch(lease, Some(sink)).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert!(response.head().await.is_none());
    }
}
