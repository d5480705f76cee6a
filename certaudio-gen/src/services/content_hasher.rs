//! Content Hasher
//!
//! Digests each topic's reference text (SHA-256 over whitespace-normalized
//! text, hex encoded) and compares it with the stored Source record.
//!
//! A topic whose text could not be fetched keeps its stored digest and is
//! never reported as changed.

use crate::db::sources::{self, SourceRecord};
use crate::models::{ContentDelta, Topic, TopicChange};
use crate::utils::text::normalize_whitespace;
use certaudio_common::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Digest of a reference text; None when there is no content
pub fn digest(text: &str) -> Option<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

/// Digest of an episode's topic snapshot (`topic_id=hash` lines in key order)
pub fn episode_digest(topic_hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (topic_id, hash) in topic_hashes {
        hasher.update(topic_id.as_bytes());
        hasher.update(b"=");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Set `content_hash` on every topic and compare against stored records
///
/// Pure; persistence happens in [`ContentHasher::record_digests`].
pub fn apply_digests(topics: &mut [Topic], stored: &HashMap<String, SourceRecord>) -> ContentDelta {
    let mut delta = ContentDelta::default();

    for topic in topics.iter_mut() {
        let previous = stored.get(&topic.id);

        if topic.fetch_failed {
            topic.content_hash = previous.and_then(|r| r.content_hash.clone());
            delta.fetch_error_count += 1;
            tracing::warn!(topic = %topic.id, "Reference text unavailable, keeping last known digest");
            continue;
        }

        topic.content_hash = digest(&topic.reference_text);
        let Some(new_hash) = topic.content_hash.clone() else {
            continue;
        };

        match previous {
            None => delta.new_topics.push(topic.id.clone()),
            Some(record) if record.content_hash.as_deref() == Some(new_hash.as_str()) => {
                delta.unchanged_count += 1;
            }
            Some(record) => {
                delta.changed.push(TopicChange {
                    topic_id: topic.id.clone(),
                    old_hash: record.content_hash.clone(),
                    new_hash,
                    affected_episodes: record.episode_refs.clone(),
                });
            }
        }
    }

    let present: HashSet<&str> = topics.iter().map(|t| t.id.as_str()).collect();
    let mut orphaned: Vec<String> = stored
        .keys()
        .filter(|id| !present.contains(id.as_str()))
        .cloned()
        .collect();
    orphaned.sort();
    delta.orphaned_topics = orphaned;

    delta
}

/// Digest computation plus Source record persistence
pub struct ContentHasher {
    db: Pool<Sqlite>,
}

impl ContentHasher {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// Digest all topics and compare with stored records
    pub async fn compare(&self, subject_id: &str, topics: &mut [Topic]) -> Result<ContentDelta> {
        let stored = sources::load_sources(&self.db, subject_id).await?;
        let delta = apply_digests(topics, &stored);

        tracing::info!(
            subject_id,
            changed = delta.changed.len(),
            unchanged = delta.unchanged_count,
            new = delta.new_topics.len(),
            fetch_errors = delta.fetch_error_count,
            orphaned = delta.orphaned_topics.len(),
            "Content delta computed"
        );
        Ok(delta)
    }

    /// Persist fresh digests once the result they belong to is saved
    ///
    /// Records of topics that failed to fetch, and of orphaned topics, are left untouched.
    pub async fn record_digests(&self, subject_id: &str, topics: &[Topic]) -> Result<()> {
        let fresh: Vec<(String, String)> = topics
            .iter()
            .filter(|t| !t.fetch_failed)
            .filter_map(|t| t.content_hash.clone().map(|h| (t.id.clone(), h)))
            .collect();
        sources::upsert_digests(&self.db, subject_id, &fresh, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::{EpisodeRef, NarrationFormat, OriginKind};

    fn topic(id: &str, text: &str) -> Topic {
        Topic {
            id: id.into(),
            title: id.into(),
            origin_kind: OriginKind::PathModule,
            parent_grouping: "M".into(),
            parent_key: "m".into(),
            domain: "P".into(),
            reference_text: text.into(),
            source_urls: vec![],
            content_hash: None,
            low_priority: false,
            fetch_failed: false,
            outline_urls: vec![],
            coverage: None,
        }
    }

    fn record(id: &str, hash: &str, refs: Vec<u32>) -> SourceRecord {
        SourceRecord {
            subject_id: "az-104".into(),
            topic_id: id.into(),
            content_hash: Some(hash.into()),
            last_checked_at: Utc::now(),
            episode_refs: refs
                .into_iter()
                .map(|n| EpisodeRef {
                    format: NarrationFormat::Instructional,
                    sequence_number: n,
                })
                .collect(),
        }
    }

    #[test]
    fn test_digest_ignores_whitespace_layout() {
        assert_eq!(digest("a  b\n\nc"), digest(" a b c "));
        assert_ne!(digest("a b c"), digest("a b d"));
        assert_eq!(digest("  \n"), None);
        assert_eq!(digest("x").unwrap().len(), 64);
    }

    #[test]
    fn test_episode_digest_is_order_independent_of_insertion() {
        let mut a = BTreeMap::new();
        a.insert("t2".to_string(), "h2".to_string());
        a.insert("t1".to_string(), "h1".to_string());
        let mut b = BTreeMap::new();
        b.insert("t1".to_string(), "h1".to_string());
        b.insert("t2".to_string(), "h2".to_string());
        assert_eq!(episode_digest(&a), episode_digest(&b));
    }

    #[test]
    fn test_delta_classification() {
        let mut topics = vec![
            topic("same", "unchanged text"),
            topic("edited", "new text"),
            topic("fresh", "brand new"),
            topic("empty", ""),
        ];
        let mut failed = topic("failed", "");
        failed.fetch_failed = true;
        topics.push(failed);

        let stored = HashMap::from([
            ("same".to_string(), record("same", &digest("unchanged text").unwrap(), vec![])),
            ("edited".to_string(), record("edited", "old-hash", vec![2])),
            ("failed".to_string(), record("failed", "kept-hash", vec![1])),
            ("gone".to_string(), record("gone", "h", vec![3])),
        ]);

        let delta = apply_digests(&mut topics, &stored);

        assert_eq!(delta.unchanged_count, 1);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].topic_id, "edited");
        assert_eq!(delta.changed[0].old_hash.as_deref(), Some("old-hash"));
        assert_eq!(delta.changed[0].affected_episodes[0].sequence_number, 2);
        assert_eq!(delta.new_topics, vec!["fresh"]);
        assert_eq!(delta.fetch_error_count, 1);
        assert_eq!(delta.orphaned_topics, vec!["gone"]);

        assert_eq!(topics[4].content_hash.as_deref(), Some("kept-hash"));
        assert_eq!(topics[3].content_hash, None);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_stored_record() {
        let pool = open_in_memory().await.unwrap();
        let hasher = ContentHasher::new(pool.clone());

        let mut first = vec![topic("u1", "version one")];
        hasher.compare("az-104", &mut first).await.unwrap();
        hasher.record_digests("az-104", &first).await.unwrap();
        let stored_hash = first[0].content_hash.clone();

        let mut second = vec![topic("u1", "")];
        second[0].fetch_failed = true;
        let delta = hasher.compare("az-104", &mut second).await.unwrap();
        hasher.record_digests("az-104", &second).await.unwrap();

        assert!(delta.changed.is_empty());
        assert_eq!(second[0].content_hash, stored_hash);
        let sources = sources::load_sources(&pool, "az-104").await.unwrap();
        assert_eq!(sources["u1"].content_hash, stored_hash);
    }

    #[tokio::test]
    async fn test_compare_does_not_persist() {
        let pool = open_in_memory().await.unwrap();
        let hasher = ContentHasher::new(pool.clone());

        let mut topics = vec![topic("u1", "version one")];
        hasher.compare("az-104", &mut topics).await.unwrap();
        assert!(sources::load_sources(&pool, "az-104").await.unwrap().is_empty());

        // an unsaved comparison leaves the change visible to the next run
        let mut again = vec![topic("u1", "version one")];
        let delta = hasher.compare("az-104", &mut again).await.unwrap();
        assert_eq!(delta.new_topics, vec!["u1"]);
    }
}
