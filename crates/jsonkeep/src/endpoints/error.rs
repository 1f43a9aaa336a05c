use axum::Json;
use axum::http::{Error as HttpError, StatusCode};
use axum::response::{IntoResponse, Response};
use jsonkeep_service::keep::KeepError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<KeepError> for ResponseError {
    fn from(err: KeepError) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            err: err.into(),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<HttpError> for ResponseError {
    fn from(err: HttpError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        // upstream failures are already logged by the fetch
        if self.status.is_server_error() && self.status != StatusCode::BAD_GATEWAY {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
