//! Source records: last known digest of each topic and the episodes covering it

use certaudio_common::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};

use super::{from_json, parse_timestamp, to_json};
use crate::models::EpisodeRef;
use crate::utils::retry_on_lock;

/// Durable per-topic digest record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub subject_id: String,
    pub topic_id: String,
    pub content_hash: Option<String>,
    pub last_checked_at: DateTime<Utc>,
    pub episode_refs: Vec<EpisodeRef>,
}

/// All Source records of a subject keyed by topic id
pub async fn load_sources(
    pool: &SqlitePool,
    subject_id: &str,
) -> Result<HashMap<String, SourceRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT topic_id, content_hash, last_checked_at, episode_refs
        FROM sources
        WHERE subject_id = ?
        "#,
    )
    .bind(subject_id)
    .fetch_all(pool)
    .await?;

    let mut records = HashMap::with_capacity(rows.len());
    for row in rows {
        let topic_id: String = row.get("topic_id");
        let last_checked_at: String = row.get("last_checked_at");
        let episode_refs: String = row.get("episode_refs");
        records.insert(
            topic_id.clone(),
            SourceRecord {
                subject_id: subject_id.to_string(),
                topic_id,
                content_hash: row.get("content_hash"),
                last_checked_at: parse_timestamp("last_checked_at", &last_checked_at)?,
                episode_refs: from_json("episode_refs", &episode_refs)?,
            },
        );
    }
    Ok(records)
}

/// Record freshly computed digests, keeping existing episode refs
pub async fn upsert_digests(
    pool: &SqlitePool,
    subject_id: &str,
    digests: &[(String, String)],
    checked_at: DateTime<Utc>,
) -> Result<()> {
    if digests.is_empty() {
        return Ok(());
    }
    let checked_at = checked_at.to_rfc3339();
    let max_wait_ms = super::settings::get_max_lock_wait_ms(pool).await?;

    retry_on_lock("upsert_source_digests", max_wait_ms, || async {
        let mut tx = pool.begin().await?;
        for (topic_id, hash) in digests {
            sqlx::query(
                r#"
                INSERT INTO sources (subject_id, topic_id, content_hash, last_checked_at, episode_refs)
                VALUES (?, ?, ?, ?, '[]')
                ON CONFLICT(subject_id, topic_id) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    last_checked_at = excluded.last_checked_at
                "#,
            )
            .bind(subject_id)
            .bind(topic_id)
            .bind(hash)
            .bind(&checked_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Link an episode to every topic it covers
///
/// Written before the episode record itself. Topics without a Source record
/// get one seeded from `topic_hashes`.
pub async fn add_episode_ref(
    pool: &SqlitePool,
    subject_id: &str,
    topic_ids: &[String],
    topic_hashes: &BTreeMap<String, String>,
    episode: &EpisodeRef,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let max_wait_ms = super::settings::get_max_lock_wait_ms(pool).await?;

    retry_on_lock("add_episode_ref", max_wait_ms, || async {
        let mut tx = pool.begin().await?;
        for topic_id in topic_ids {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT episode_refs FROM sources WHERE subject_id = ? AND topic_id = ?",
            )
            .bind(subject_id)
            .bind(topic_id)
            .fetch_optional(&mut *tx)
            .await?;

            let mut refs: Vec<EpisodeRef> = match existing {
                Some((raw,)) => from_json("episode_refs", &raw)?,
                None => Vec::new(),
            };
            if !refs.contains(episode) {
                refs.push(episode.clone());
                refs.sort();
            }
            let refs = to_json(&refs)?;

            sqlx::query(
                r#"
                INSERT INTO sources (subject_id, topic_id, content_hash, last_checked_at, episode_refs)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(subject_id, topic_id) DO UPDATE SET
                    episode_refs = excluded.episode_refs
                "#,
            )
            .bind(subject_id)
            .bind(topic_id)
            .bind(topic_hashes.get(topic_id))
            .bind(&now)
            .bind(&refs)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}
