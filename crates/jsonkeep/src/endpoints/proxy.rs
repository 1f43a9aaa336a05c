use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode, Uri, header};
use bytes::Bytes;
use jsonkeep_service::fetch::{LiveHead, live_channel};
use jsonkeep_service::keep::Fetching;
use jsonkeep_service::metric;
use sentry::{Hub, SentryFutureExt};

use crate::service::Service;

use super::ResponseError;

const UPSTREAM_FAILED: &str = "failed to fetch the document from the upstream";

fn json_response(body: Body) -> Result<Response<Body>, ResponseError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)?)
}

fn document_response(data: Bytes) -> Result<Response<Body>, ResponseError> {
    json_response(Body::from(data))
}

/// Serves a path from the cache store, or fetches it from the upstream.
pub async fn proxy_request(
    State(service): State<Service>,
    uri: Uri,
) -> Result<Response<Body>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /*path"));
    });

    let path = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/")
        .to_owned();
    service.keep().request(path.as_str());

    match service.store().get(&path).await {
        Ok(Some(data)) => {
            metric!(counter("proxy.store") += 1, "status" => "hit");
            return document_response(data);
        }
        Ok(None) => metric!(counter("proxy.store") += 1, "status" => "miss"),
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                path = %path,
                "Failed to read from the {} store",
                service.store().name(),
            );
            metric!(counter("proxy.store") += 1, "status" => "error");
        }
    }

    match service.keep().fetching(path.as_str()).await? {
        Fetching::Lead(lease) => {
            let (sink, response) = live_channel();
            let fetcher = service.fetcher().clone();
            // The fetch outlives this request, the cache and other waiters still need it if
            // the client goes away.
            let fetch = async move {
                fetcher.fetch(lease, Some(sink)).await.ok();
            };
            tokio::spawn(fetch.bind_hub(Hub::new_from_top(Hub::current())));

            match response.head().await {
                Some(LiveHead::Stream(body)) => json_response(Body::from_stream(body)),
                Some(LiveHead::Rejected(reason)) => Err((StatusCode::BAD_REQUEST, reason).into()),
                None => Err((StatusCode::BAD_GATEWAY, UPSTREAM_FAILED).into()),
            }
        }
        Fetching::Data(data) => document_response(data),
        Fetching::Failed => Err((StatusCode::BAD_GATEWAY, UPSTREAM_FAILED).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonkeep_service::config::Config;
    use jsonkeep_test::{Origin, Server};
    use reqwest::Url;

    use crate::endpoints::create_app;

    use super::*;

    fn server(upstream: Url) -> (Server, Service) {
        jsonkeep_test::setup();
        let config = Config {
            upstream,
            ..Default::default()
        };
        let service = Service::create(&config).unwrap();
        (Server::with_router(create_app(service.clone())), service)
    }

    async fn wait_for_store(service: &Service, path: &str) {
        for _ in 0..100 {
            if service.store().get(path).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{path} was never stored");
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let origin = Origin::new();
        let (server, _service) = server(origin.url("/"));

        let client = reqwest::Client::new();
        let requests = (0..5).map(|_| {
            let request = client.get(server.url("/slow/300ms/users?page=2")).send();
            async move {
                let response = request.await.unwrap();
                assert_eq!(response.status(), 200);
                assert_eq!(
                    response.headers()[header::CONTENT_TYPE],
                    "application/json"
                );
                response.text().await.unwrap()
            }
        });
        let bodies = futures::future::join_all(requests).await;

        for body in bodies {
            assert_eq!(body, r#"{"path":"/slow/300ms/users?page=2"}"#);
        }
        assert_eq!(origin.hits("/slow/300ms/users?page=2"), 1);
    }

    #[tokio::test]
    async fn test_store_hit() {
        let origin = Origin::new();
        let (server, service) = server(origin.url("/"));

        let response = reqwest::get(server.url("/a")).await.unwrap();
        assert_eq!(response.text().await.unwrap(), r#"{"path":"/a"}"#);
        wait_for_store(&service, "/a").await;

        let response = reqwest::get(server.url("/a")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), r#"{"path":"/a"}"#);
        assert_eq!(origin.hits("/a"), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_data() {
        let origin = Origin::new();
        let (server, _service) = server(origin.url("/"));

        let response = reqwest::get(server.url("/status/404/a")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), r#"{"status":404}"#);
    }

    #[tokio::test]
    async fn test_not_json() {
        let origin = Origin::new();
        let (server, service) = server(origin.url("/"));

        let response = reqwest::get(server.url("/text/a")).await.unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "Endpoint does not return JSON");

        assert_eq!(service.store().get("/text/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upstream_unreachable() {
        // nothing listens on the discard port
        let (server, _service) = server("http://127.0.0.1:9/".parse().unwrap());

        let response = reqwest::get(server.url("/a")).await.unwrap();
        assert_eq!(response.status(), 502);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["detail"], UPSTREAM_FAILED);
    }
}
