use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::Service;

mod entries;
mod error;
mod metrics;
mod proxy;

pub use error::ResponseError;
use metrics::MetricsLayer;

use entries::list_entries as entries;
use proxy::proxy_request as proxy;

/// Reports the server as unhealthy once the keep has stopped, so it gets restarted.
pub async fn healthcheck(State(service): State<Service>) -> (StatusCode, &'static str) {
    jsonkeep_service::metric!(counter("healthcheck") += 1);
    if service.keep().is_running() {
        (StatusCode::OK, "ok")
    } else {
        tracing::error!("Healthcheck failed, the keep has stopped");
        (StatusCode::SERVICE_UNAVAILABLE, "keep stopped")
    }
}

pub fn create_app(service: Service) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/_keep/entries", get(entries))
        .route("/", get(proxy))
        .route("/*path", get(proxy))
        .with_state(service.clone())
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck).with_state(service))
}
