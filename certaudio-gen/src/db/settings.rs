//! Settings database operations
//!
//! Key-value accessors over the `settings` table. API keys stored here take
//! priority over environment and TOML.

use certaudio_common::{Error, Result};
use sqlx::{Pool, Sqlite};

use crate::utils::DEFAULT_MAX_LOCK_WAIT_MS;

pub const NARRATION_API_KEY: &str = "narration_api_key";
pub const SPEECH_API_KEY: &str = "speech_api_key";
pub const MAX_LOCK_WAIT_MS: &str = "db_max_lock_wait_ms";

pub async fn get_narration_api_key(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, NARRATION_API_KEY).await
}

pub async fn set_narration_api_key(db: &Pool<Sqlite>, key: String) -> Result<()> {
    set_setting(db, NARRATION_API_KEY, key).await
}

pub async fn get_speech_api_key(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, SPEECH_API_KEY).await
}

pub async fn set_speech_api_key(db: &Pool<Sqlite>, key: String) -> Result<()> {
    set_setting(db, SPEECH_API_KEY, key).await
}

/// Lock wait budget for metadata writes
///
/// **Default:** 5000 ms
pub async fn get_max_lock_wait_ms(db: &Pool<Sqlite>) -> Result<u64> {
    get_setting(db, MAX_LOCK_WAIT_MS)
        .await
        .map(|opt| opt.unwrap_or(DEFAULT_MAX_LOCK_WAIT_MS))
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}
