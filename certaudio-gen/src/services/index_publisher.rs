//! Episode index publication
//!
//! Builds the listing a web player reads: episodes grouped by group title,
//! with totals and amendment links. Publication is refused while the base
//! series is too short or has holes.

use super::object_store::ObjectStore;
use crate::error::ExternalError;
use crate::models::{EpisodeRecord, NarrationFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("only {found} base episode(s) exist, at least {required} required")]
    TooFewEpisodes { found: usize, required: usize },

    #[error("base episode(s) missing: {missing:?}")]
    MissingEpisodes { missing: Vec<u32> },

    #[error("index serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index upload failed: {0}")]
    Upload(#[from] ExternalError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub sequence_number: u32,
    pub title: String,
    pub audio_url: String,
    pub script_url: String,
    pub duration_seconds: f64,
    pub word_count: usize,
    pub is_amendment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amendment_of: Option<u32>,
    /// Sequence numbers of amendments to this episode
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub amended_by: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexGroup {
    pub title: String,
    pub episodes: Vec<IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeIndex {
    pub subject_id: String,
    pub format: NarrationFormat,
    pub total_episodes: usize,
    pub amendment_count: usize,
    pub total_duration_seconds: f64,
    pub groups: Vec<IndexGroup>,
    pub generated_at: DateTime<Utc>,
}

/// Object path of the index for a series
pub fn index_path(subject_id: &str, format: NarrationFormat) -> String {
    format!("{}-{}/metadata/index.json", subject_id, format)
}

/// Build the index from a series' records
///
/// Groups appear in order of their first episode.
pub fn build_index(
    subject_id: &str,
    format: NarrationFormat,
    records: &[EpisodeRecord],
    min_episodes: usize,
) -> Result<EpisodeIndex, IndexError> {
    let mut sorted: Vec<&EpisodeRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.sequence_number);

    let base: Vec<u32> = sorted
        .iter()
        .filter(|r| r.amendment_of.is_none())
        .map(|r| r.sequence_number)
        .collect();
    if base.len() < min_episodes {
        return Err(IndexError::TooFewEpisodes {
            found: base.len(),
            required: min_episodes,
        });
    }
    let missing: Vec<u32> = (1..=min_episodes as u32)
        .filter(|seq| !sorted.iter().any(|r| r.sequence_number == *seq))
        .collect();
    if !missing.is_empty() {
        return Err(IndexError::MissingEpisodes { missing });
    }

    let mut groups: Vec<IndexGroup> = Vec::new();
    for record in &sorted {
        let amended_by = sorted
            .iter()
            .filter(|r| r.amendment_of == Some(record.sequence_number))
            .map(|r| r.sequence_number)
            .collect();
        let entry = IndexEntry {
            id: record.id.clone(),
            sequence_number: record.sequence_number,
            title: record.title.clone(),
            audio_url: record.audio_url.clone(),
            script_url: record.script_url.clone(),
            duration_seconds: record.duration_seconds,
            word_count: record.word_count,
            is_amendment: record.amendment_of.is_some(),
            amendment_of: record.amendment_of,
            amended_by,
        };
        match groups.iter_mut().find(|g| g.title == record.group_title) {
            Some(group) => group.episodes.push(entry),
            None => groups.push(IndexGroup {
                title: record.group_title.clone(),
                episodes: vec![entry],
            }),
        }
    }

    Ok(EpisodeIndex {
        subject_id: subject_id.to_string(),
        format,
        total_episodes: sorted.len(),
        amendment_count: sorted.len() - base.len(),
        total_duration_seconds: sorted.iter().map(|r| r.duration_seconds).sum(),
        groups,
        generated_at: Utc::now(),
    })
}

/// Upload the index and return its URL
pub async fn publish(store: &dyn ObjectStore, index: &EpisodeIndex) -> Result<String, IndexError> {
    let body = serde_json::to_vec_pretty(index)?;
    let path = index_path(&index.subject_id, index.format);
    let url = store.put(&path, body, "application/json").await?;

    tracing::info!(
        subject_id = %index.subject_id,
        format = %index.format,
        episodes = index.total_episodes,
        amendments = index.amendment_count,
        url = %url,
        "Published episode index"
    );
    Ok(url)
}
