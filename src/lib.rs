//! clinannot - clinical image annotation backend
//!
//! Clinicians upload medical images with free-text diagnostic labels.
//! Uploads are content-hashed so duplicate images merge into one stored
//! record, and up to a policy-bounded number of independent reviewer
//! opinions attach to the same image under the consensus rules in
//! `services::consensus`.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod sanitize;
pub mod services;

pub use crate::error::{ApiError, ApiResult, Error, Result};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::consensus::{ConsensusEngine, ThirdOpinionPolicy};
use crate::services::image_store::ImageStore;

/// Upload size ceiling (raw image bytes plus form fields).
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Consensus engine wrapping the repository and image store
    pub engine: Arc<ConsensusEngine>,
    /// Service startup timestamp for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, store: Arc<ImageStore>, policy: ThirdOpinionPolicy) -> Self {
        Self {
            engine: Arc::new(ConsensusEngine::new(db.clone(), store, policy)),
            db,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::diagnostic_routes())
        .merge(api::gallery_routes())
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
