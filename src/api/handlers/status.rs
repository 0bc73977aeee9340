//! Status and health check handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::error::{reject, ApiError};
use crate::api::ApiState;
use crate::service::CirculationSummary;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    /// Crate version.
    pub version: String,

    /// Catalog, loan and fine counts.
    pub summary: CirculationSummary,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<ApiState>>) -> Result<Json<HealthResponse>, ApiError> {
    let summary = state
        .service
        .summary(chrono::Utc::now())
        .await
        .map_err(reject)?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        summary,
    }))
}
