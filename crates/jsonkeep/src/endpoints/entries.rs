use axum::Json;
use axum::extract::State;
use jsonkeep_service::keep::EntryInfo;

use crate::service::Service;

use super::ResponseError;

/// Lists every path the keep knows about.
pub async fn list_entries(
    State(service): State<Service>,
) -> Result<Json<Vec<EntryInfo>>, ResponseError> {
    Ok(Json(service.keep().entries().await?))
}
