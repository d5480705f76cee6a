//! Plan ledger: episode units persisted the first time they are planned
//!
//! Rows backing an Episode Record are never changed. Pending rows (no record
//! yet) may be dropped or rewritten by a later planning pass.

use certaudio_common::Result;
use sqlx::{Row, SqlitePool};

use super::{from_json, parse_format, to_json};
use crate::models::{EpisodeUnit, NarrationFormat};
use crate::utils::retry_on_lock;

/// Drop `retired` pending rows, then write `units`, in one transaction
///
/// Writing over a sequence number that still has a row is an error.
pub async fn revise_units(
    pool: &SqlitePool,
    subject_id: &str,
    format: NarrationFormat,
    retired: &[u32],
    units: &[EpisodeUnit],
) -> Result<()> {
    if retired.is_empty() && units.is_empty() {
        return Ok(());
    }

    let mut prepared = Vec::with_capacity(units.len());
    for unit in units {
        prepared.push((unit, to_json(&unit.topic_ids)?, to_json(&unit.topic_hashes)?));
    }
    let created_at = chrono::Utc::now().to_rfc3339();
    let max_wait_ms = super::settings::get_max_lock_wait_ms(pool).await?;

    retry_on_lock("revise_episode_units", max_wait_ms, || async {
        let mut tx = pool.begin().await?;
        for sequence_number in retired {
            sqlx::query(
                r#"
                DELETE FROM episode_units
                WHERE subject_id = ? AND format = ? AND sequence_number = ?
                  AND NOT EXISTS (
                      SELECT 1 FROM episodes e
                      WHERE e.subject_id = episode_units.subject_id
                        AND e.format = episode_units.format
                        AND e.sequence_number = episode_units.sequence_number
                  )
                "#,
            )
            .bind(subject_id)
            .bind(format.as_str())
            .bind(*sequence_number as i64)
            .execute(&mut *tx)
            .await?;
        }
        for (unit, topic_ids, topic_hashes) in &prepared {
            sqlx::query(
                r#"
                INSERT INTO episode_units (
                    subject_id, format, sequence_number, group_title,
                    topic_ids, topic_hashes, amendment_of, instruction, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&unit.subject_id)
            .bind(unit.format.as_str())
            .bind(unit.sequence_number as i64)
            .bind(&unit.group_title)
            .bind(topic_ids)
            .bind(topic_hashes)
            .bind(unit.amendment_of.map(i64::from))
            .bind(&unit.instruction)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Ledger for one subject+format in sequence order
pub async fn load_units(
    pool: &SqlitePool,
    subject_id: &str,
    format: NarrationFormat,
) -> Result<Vec<EpisodeUnit>> {
    let rows = sqlx::query(
        r#"
        SELECT subject_id, format, sequence_number, group_title,
               topic_ids, topic_hashes, amendment_of, instruction
        FROM episode_units
        WHERE subject_id = ? AND format = ?
        ORDER BY sequence_number
        "#,
    )
    .bind(subject_id)
    .bind(format.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let format: String = row.get("format");
            let topic_ids: String = row.get("topic_ids");
            let topic_hashes: String = row.get("topic_hashes");
            let sequence_number: i64 = row.get("sequence_number");
            let amendment_of: Option<i64> = row.get("amendment_of");
            Ok(EpisodeUnit {
                subject_id: row.get("subject_id"),
                format: parse_format(&format)?,
                sequence_number: sequence_number as u32,
                group_title: row.get("group_title"),
                topic_ids: from_json("topic_ids", &topic_ids)?,
                topic_hashes: from_json("topic_hashes", &topic_hashes)?,
                amendment_of: amendment_of.map(|n| n as u32),
                instruction: row.get("instruction"),
            })
        })
        .collect()
}
