//! SQLite metadata store
//!
//! One database file in the root folder. Every write is keyed by
//! `(subject_id, format, sequence_number)` or `(subject_id, topic_id)` and
//! wrapped in [`retry_on_lock`](crate::utils::retry_on_lock).

pub mod discovery_runs;
pub mod episodes;
pub mod settings;
pub mod sources;
pub mod units;

use certaudio_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (creating if needed) the database file and initialize tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with tables initialized
///
/// An in-memory SQLite database is private to its connection, so the pool is
/// capped at one connection.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discovery_runs (
            run_id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            grade TEXT NOT NULL,
            topic_count INTEGER NOT NULL,
            gap_count INTEGER NOT NULL,
            result_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_discovery_runs_subject ON discovery_runs(subject_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            subject_id TEXT NOT NULL,
            topic_id TEXT NOT NULL,
            content_hash TEXT,
            last_checked_at TEXT NOT NULL,
            episode_refs TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (subject_id, topic_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS episode_units (
            subject_id TEXT NOT NULL,
            format TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            group_title TEXT NOT NULL,
            topic_ids TEXT NOT NULL,
            topic_hashes TEXT NOT NULL,
            amendment_of INTEGER,
            instruction TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (subject_id, format, sequence_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            id TEXT NOT NULL UNIQUE,
            subject_id TEXT NOT NULL,
            format TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            title TEXT NOT NULL,
            group_title TEXT NOT NULL,
            topic_ids TEXT NOT NULL,
            topic_hashes TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            audio_url TEXT NOT NULL,
            script_url TEXT NOT NULL,
            markup_url TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            word_count INTEGER NOT NULL,
            amendment_of INTEGER,
            source_urls TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            PRIMARY KEY (subject_id, format, sequence_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (settings, discovery_runs, sources, episode_units, episodes)"
    );

    Ok(())
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", column, e)))
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_format(raw: &str) -> Result<crate::models::NarrationFormat> {
    raw.parse().map_err(Error::Internal)
}
