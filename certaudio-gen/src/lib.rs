//! certaudio-gen library interface
//!
//! Exposes the pipeline services and the read API for the binary and for
//! integration testing.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use certaudio_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Metadata store
    pub db: SqlitePool,
    /// Pipeline progress events for SSE subscribers
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self {
            db,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build the read API router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::subject_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
