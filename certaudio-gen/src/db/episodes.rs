//! Episode records
//!
//! Append-only store keyed by `(subject_id, format, sequence_number)`;
//! `amendment_of` is just another sequence number in the same store.

use certaudio_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_json, parse_format, parse_timestamp, to_json};
use crate::models::{EpisodeRecord, NarrationFormat};
use crate::utils::retry_on_lock;

const SELECT_COLUMNS: &str = r#"
    SELECT id, subject_id, format, sequence_number, title, group_title,
           topic_ids, topic_hashes, content_hash, audio_url, script_url,
           markup_url, duration_seconds, word_count, amendment_of,
           source_urls, created_at
    FROM episodes
"#;

/// True when a record exists for the sequence number
pub async fn exists(
    pool: &SqlitePool,
    subject_id: &str,
    format: NarrationFormat,
    sequence_number: u32,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM episodes WHERE subject_id = ? AND format = ? AND sequence_number = ?",
    )
    .bind(subject_id)
    .bind(format.as_str())
    .bind(sequence_number as i64)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Write a record
///
/// With `replace = false` an existing sequence number is an error, so a
/// record is written at most once. `replace = true` is used for forced
/// regeneration.
pub async fn save_record(pool: &SqlitePool, record: &EpisodeRecord, replace: bool) -> Result<()> {
    let topic_ids = to_json(&record.topic_ids)?;
    let topic_hashes = to_json(&record.topic_hashes)?;
    let source_urls = to_json(&record.source_urls)?;
    let created_at = record.created_at.to_rfc3339();
    let verb = if replace {
        "INSERT OR REPLACE"
    } else {
        "INSERT"
    };
    let sql = format!(
        r#"
        {} INTO episodes (
            id, subject_id, format, sequence_number, title, group_title,
            topic_ids, topic_hashes, content_hash, audio_url, script_url,
            markup_url, duration_seconds, word_count, amendment_of,
            source_urls, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        verb
    );
    let max_wait_ms = super::settings::get_max_lock_wait_ms(pool).await?;

    retry_on_lock("save_episode_record", max_wait_ms, || async {
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.subject_id)
            .bind(record.format.as_str())
            .bind(record.sequence_number as i64)
            .bind(&record.title)
            .bind(&record.group_title)
            .bind(&topic_ids)
            .bind(&topic_hashes)
            .bind(&record.content_hash)
            .bind(&record.audio_url)
            .bind(&record.script_url)
            .bind(&record.markup_url)
            .bind(record.duration_seconds)
            .bind(record.word_count as i64)
            .bind(record.amendment_of.map(i64::from))
            .bind(&source_urls)
            .bind(&created_at)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

/// Records for one subject+format in sequence order
pub async fn load_records(
    pool: &SqlitePool,
    subject_id: &str,
    format: NarrationFormat,
) -> Result<Vec<EpisodeRecord>> {
    let sql = format!(
        "{} WHERE subject_id = ? AND format = ? ORDER BY sequence_number",
        SELECT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(subject_id)
        .bind(format.as_str())
        .fetch_all(pool)
        .await?;

    rows.iter().map(record_from_row).collect()
}

pub async fn load_record(
    pool: &SqlitePool,
    subject_id: &str,
    format: NarrationFormat,
    sequence_number: u32,
) -> Result<Option<EpisodeRecord>> {
    let sql = format!(
        "{} WHERE subject_id = ? AND format = ? AND sequence_number = ?",
        SELECT_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(subject_id)
        .bind(format.as_str())
        .bind(sequence_number as i64)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<EpisodeRecord> {
    let format: String = row.get("format");
    let sequence_number: i64 = row.get("sequence_number");
    let topic_ids: String = row.get("topic_ids");
    let topic_hashes: String = row.get("topic_hashes");
    let word_count: i64 = row.get("word_count");
    let amendment_of: Option<i64> = row.get("amendment_of");
    let source_urls: String = row.get("source_urls");
    let created_at: String = row.get("created_at");

    Ok(EpisodeRecord {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        format: parse_format(&format)?,
        sequence_number: sequence_number as u32,
        title: row.get("title"),
        group_title: row.get("group_title"),
        topic_ids: from_json("topic_ids", &topic_ids)?,
        topic_hashes: from_json("topic_hashes", &topic_hashes)?,
        content_hash: row.get("content_hash"),
        audio_url: row.get("audio_url"),
        script_url: row.get("script_url"),
        markup_url: row.get("markup_url"),
        duration_seconds: row.get("duration_seconds"),
        word_count: word_count as usize,
        amendment_of: amendment_of.map(|n| n as u32),
        source_urls: from_json("source_urls", &source_urls)?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
