//! Subject endpoints
//!
//! - `GET /subjects/:id/discovery` latest discovery result
//! - `GET /subjects/:id/report` confidence, gaps and content delta
//! - `GET /subjects/:id/formats/:format/episodes` episode records by sequence

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    ConfidenceReport, ContentDelta, DiscoveryMode, DiscoveryResult, EpisodeRecord,
    NarrationFormat,
};
use crate::AppState;

/// Operator-facing coverage report
#[derive(Debug, Serialize)]
pub struct CoverageReportResponse {
    pub subject_id: String,
    pub run_id: Uuid,
    pub mode: DiscoveryMode,
    pub topic_count: usize,
    pub confidence: ConfidenceReport,
    pub gaps: Vec<GapEntry>,
    pub delta: ContentDelta,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct GapEntry {
    pub topic_id: String,
    pub title: String,
    pub parent_grouping: String,
}

#[derive(Debug, Serialize)]
pub struct EpisodeListResponse {
    pub subject_id: String,
    pub format: NarrationFormat,
    pub count: usize,
    pub episodes: Vec<EpisodeRecord>,
}

async fn latest_result(state: &AppState, subject_id: &str) -> ApiResult<DiscoveryResult> {
    db::discovery_runs::load_latest(&state.db, subject_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No discovery result for subject {}", subject_id)))
}

/// GET /subjects/:id/discovery
pub async fn get_discovery(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<DiscoveryResult>> {
    Ok(Json(latest_result(&state, &subject_id).await?))
}

/// GET /subjects/:id/report
pub async fn get_report(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<CoverageReportResponse>> {
    let result = latest_result(&state, &subject_id).await?;

    let gaps = result
        .gaps
        .iter()
        .filter_map(|id| result.topic(id))
        .map(|t| GapEntry {
            topic_id: t.id.clone(),
            title: t.title.clone(),
            parent_grouping: t.parent_grouping.clone(),
        })
        .collect();

    Ok(Json(CoverageReportResponse {
        subject_id: result.subject_id.clone(),
        run_id: result.run_id,
        mode: result.mode,
        topic_count: result.topics.len(),
        confidence: result.confidence.clone(),
        gaps,
        delta: result.delta.clone(),
        created_at: result.created_at,
    }))
}

/// GET /subjects/:id/formats/:format/episodes
pub async fn list_episodes(
    State(state): State<AppState>,
    Path((subject_id, format)): Path<(String, String)>,
) -> ApiResult<Json<EpisodeListResponse>> {
    let format: NarrationFormat = format.parse().map_err(ApiError::BadRequest)?;
    let episodes = db::episodes::load_records(&state.db, &subject_id, format).await?;

    Ok(Json(EpisodeListResponse {
        subject_id,
        format,
        count: episodes.len(),
        episodes,
    }))
}

pub fn subject_routes() -> Router<AppState> {
    Router::new()
        .route("/subjects/:id/discovery", get(get_discovery))
        .route("/subjects/:id/report", get(get_report))
        .route("/subjects/:id/formats/:format/episodes", get(list_episodes))
}
