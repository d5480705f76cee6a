//! Discovery result snapshots
//!
//! Each run stores its immutable result as one JSON document; the newest row
//! per subject is the current topic graph.

use certaudio_common::Result;
use sqlx::{Row, SqlitePool};

use super::{from_json, to_json};
use crate::models::DiscoveryResult;
use crate::utils::retry_on_lock;

/// Store a discovery result (never updated afterwards)
pub async fn save_result(pool: &SqlitePool, result: &DiscoveryResult) -> Result<()> {
    let run_id = result.run_id.to_string();
    let result_json = to_json(result)?;
    let grade = result.confidence.grade.to_string();
    let created_at = result.created_at.to_rfc3339();
    let max_wait_ms = super::settings::get_max_lock_wait_ms(pool).await?;

    retry_on_lock("save_discovery_result", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO discovery_runs (
                run_id, subject_id, mode, confidence_score, grade,
                topic_count, gap_count, result_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(&result.subject_id)
        .bind(result.mode.as_str())
        .bind(result.confidence.score)
        .bind(&grade)
        .bind(result.topics.len() as i64)
        .bind(result.gaps.len() as i64)
        .bind(&result_json)
        .bind(&created_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Most recent discovery result for a subject
pub async fn load_latest(pool: &SqlitePool, subject_id: &str) -> Result<Option<DiscoveryResult>> {
    let row = sqlx::query(
        r#"
        SELECT result_json FROM discovery_runs
        WHERE subject_id = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(subject_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let raw: String = row.get("result_json");
            Ok(Some(from_json("result_json", &raw)?))
        }
        None => Ok(None),
    }
}
