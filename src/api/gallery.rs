//! Gallery API handler

use axum::{extract::State, routing::get, Json, Router};

use crate::db::diagnoses;
use crate::error::{ApiError, ApiResult};
use crate::services::gallery::{self, GalleryGroup};
use crate::AppState;

/// GET /api/gallery
///
/// Grouped-by-fingerprint view: one entry per stored image with every
/// attached opinion.
pub async fn gallery_view(State(state): State<AppState>) -> ApiResult<Json<Vec<GalleryGroup>>> {
    let records = diagnoses::load_all(&state.db).await.map_err(ApiError::from)?;
    Ok(Json(gallery::project(&records)))
}

/// Build gallery routes
pub fn gallery_routes() -> Router<AppState> {
    Router::new().route("/api/gallery", get(gallery_view))
}
