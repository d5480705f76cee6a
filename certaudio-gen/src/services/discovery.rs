//! Discovery run
//!
//! Fetch → merge → reconcile → hash → persist, for one subject.
//!
//! Catalog groupings and unit texts are fetched concurrently with no shared
//! mutable state; results are merged only after every fetch has completed.
//! Any catalog or outline fetch that fails after retries aborts the run and
//! nothing is published. A unit whose text cannot be fetched is kept with
//! its last known digest.

use super::catalog_client::{CatalogGrouping, CatalogSource, CatalogUnit, SkillOutlineSource};
use super::content_hasher::ContentHasher;
use super::coverage_reconciler::{compute_confidence, CoverageConfig, CoverageReconciler};
use super::doc_search_client::DocumentationSearch;
use super::topic_merger::{self, MergedGraph, UnitText};
use crate::db;
use crate::error::DiscoveryError;
use crate::models::{DiscoveryMode, DiscoveryResult, OriginKind};
use crate::utils::{with_retry, RetryPolicy};
use certaudio_common::events::{EventBus, PipelineEvent};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// External catalogs read by discovery
#[derive(Clone)]
pub struct DiscoverySources {
    pub catalog: Arc<dyn CatalogSource>,
    pub skills: Arc<dyn SkillOutlineSource>,
    pub search: Arc<dyn DocumentationSearch>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub retry: RetryPolicy,
    pub coverage: CoverageConfig,
    /// Concurrent catalog fetches
    pub fetch_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            coverage: CoverageConfig::default(),
            fetch_concurrency: 4,
        }
    }
}

/// Discovery service
pub struct DiscoveryService {
    db: SqlitePool,
    event_bus: EventBus,
    sources: DiscoverySources,
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        sources: DiscoverySources,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            sources,
            config,
        }
    }

    /// Run discovery for a subject and persist the result
    pub async fn discover(
        &self,
        subject_id: &str,
        mode: DiscoveryMode,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let run_id = Uuid::new_v4();
        tracing::info!(run_id = %run_id, subject_id, mode = %mode, "Discovery started");

        let (groupings, unit_texts) = if mode.includes_paths() {
            let groupings = self.fetch_groupings(subject_id).await?;
            let unit_texts = self.fetch_unit_texts(&groupings).await;
            (groupings, unit_texts)
        } else {
            (Vec::new(), HashMap::new())
        };

        let outline = if mode.includes_skills() {
            with_retry(&self.config.retry, "fetch_skill_outline", || {
                self.sources.skills.fetch_outline(subject_id)
            })
            .await
            .map_err(|e| DiscoveryError::Fetch {
                operation: e.operation,
                source: e.error,
            })?
        } else {
            Vec::new()
        };

        let graph: MergedGraph = topic_merger::merge(&groupings, &unit_texts, &outline)?;
        let has_skills = graph
            .topics
            .iter()
            .any(|t| t.origin_kind == OriginKind::ExamSkill);

        let mut topics = if has_skills {
            let reconciler = CoverageReconciler::new(
                self.sources.search.clone(),
                self.config.retry.clone(),
                self.config.coverage.clone(),
            );
            reconciler.reconcile(graph).await
        } else {
            graph.topics
        };
        topic_merger::validate(&topics)?;

        let hasher = ContentHasher::new(self.db.clone());
        let delta = hasher.compare(subject_id, &mut topics).await?;
        let confidence = compute_confidence(&topics);
        let gaps: Vec<String> = topics
            .iter()
            .filter(|t| t.is_gap())
            .map(|t| t.id.clone())
            .collect();

        let result = DiscoveryResult {
            run_id,
            subject_id: subject_id.to_string(),
            mode,
            topics,
            confidence,
            gaps,
            delta,
            created_at: Utc::now(),
        };
        db::discovery_runs::save_result(&self.db, &result).await?;
        // digests follow the saved result so an unsaved run leaves its delta for the next
        hasher.record_digests(subject_id, &result.topics).await?;

        tracing::info!(
            run_id = %run_id,
            subject_id,
            topics = result.topics.len(),
            gaps = result.gaps.len(),
            confidence = result.confidence.score,
            grade = %result.confidence.grade,
            changed = result.delta.changed.len(),
            "Discovery completed"
        );
        self.event_bus.emit_lossy(PipelineEvent::DiscoveryCompleted {
            run_id,
            subject_id: subject_id.to_string(),
            topic_count: result.topics.len(),
            gap_count: result.gaps.len(),
            confidence_score: result.confidence.score,
            grade: result.confidence.grade.to_string(),
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    /// All groupings, in catalog order
    async fn fetch_groupings(&self, subject_id: &str) -> Result<Vec<CatalogGrouping>, DiscoveryError> {
        let retry = &self.config.retry;
        let catalog = &self.sources.catalog;

        let refs = with_retry(retry, "list_groupings", || catalog.list_groupings(subject_id))
            .await
            .map_err(|e| DiscoveryError::Fetch {
                operation: e.operation,
                source: e.error,
            })?;
        tracing::debug!(subject_id, groupings = refs.len(), "Listed catalog groupings");

        // buffered (not buffer_unordered) keeps catalog order
        stream::iter(refs)
            .map(|grouping| async move {
                with_retry(retry, "fetch_grouping", || {
                    catalog.fetch_grouping(subject_id, &grouping.uid)
                })
                .await
                .map_err(|e| DiscoveryError::Fetch {
                    operation: format!("{} {}", e.operation, grouping.uid),
                    source: e.error,
                })
            })
            .buffered(self.config.fetch_concurrency.max(1))
            .try_collect()
            .await
    }

    /// Reference text per unit UID; failures are recorded, not raised
    async fn fetch_unit_texts(&self, groupings: &[CatalogGrouping]) -> HashMap<String, UnitText> {
        let mut seen = HashSet::new();
        let units: Vec<&CatalogUnit> = groupings
            .iter()
            .flat_map(|g| g.modules.iter())
            .flat_map(|m| m.units.iter())
            .filter(|u| seen.insert(u.uid.as_str()))
            .collect();

        let retry = &self.config.retry;
        let catalog = &self.sources.catalog;
        let texts: Vec<(String, UnitText)> = stream::iter(units)
            .map(|unit| async move {
                let text = match with_retry(retry, "fetch_unit_text", || catalog.fetch_unit_text(unit)).await {
                    Ok(text) => UnitText::Fetched(text),
                    Err(e) => {
                        tracing::warn!(unit = %unit.uid, error = %e, "Unit text fetch failed");
                        UnitText::Failed
                    }
                };
                (unit.uid.clone(), text)
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;

        texts.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalError;
    use crate::services::catalog_client::{
        CatalogModule, GroupingRef, SkillDomain, SkillEntry, SkillObjective,
    };
    use crate::services::doc_search_client::SearchHit;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeCatalog {
        fail_groupings: bool,
        unit_text: Mutex<HashMap<String, Result<String, ExternalError>>>,
    }

    #[async_trait]
    impl CatalogSource for FakeCatalog {
        async fn list_groupings(&self, _subject_id: &str) -> Result<Vec<GroupingRef>, ExternalError> {
            if self.fail_groupings {
                return Err(ExternalError::Permanent("catalog down".into()));
            }
            Ok(vec![GroupingRef {
                uid: "path-1".into(),
                title: "Storage path".into(),
            }])
        }

        async fn fetch_grouping(
            &self,
            _subject_id: &str,
            uid: &str,
        ) -> Result<CatalogGrouping, ExternalError> {
            Ok(CatalogGrouping {
                uid: uid.into(),
                title: "Storage path".into(),
                modules: vec![CatalogModule {
                    uid: "mod-storage".into(),
                    title: "Configure storage accounts".into(),
                    summary: "Create and secure storage accounts".into(),
                    url: "https://learn/mod-storage".into(),
                    units: vec![
                        CatalogUnit {
                            uid: "u-intro".into(),
                            title: "Introduction".into(),
                            url: "https://learn/u-intro".into(),
                            kind: None,
                        },
                        CatalogUnit {
                            uid: "u-redundancy".into(),
                            title: "Configure storage redundancy".into(),
                            url: "https://learn/u-redundancy".into(),
                            kind: None,
                        },
                    ],
                }],
            })
        }

        async fn fetch_unit_text(&self, unit: &CatalogUnit) -> Result<String, ExternalError> {
            self.unit_text
                .lock()
                .unwrap()
                .get(&unit.uid)
                .cloned()
                .unwrap_or_else(|| Ok(format!("Text of {}", unit.title)))
        }
    }

    struct FakeOutline;

    #[async_trait]
    impl SkillOutlineSource for FakeOutline {
        async fn fetch_outline(&self, _subject_id: &str) -> Result<Vec<SkillDomain>, ExternalError> {
            Ok(vec![SkillDomain {
                name: "Implement storage".into(),
                weight: None,
                objectives: vec![SkillObjective {
                    name: "Configure storage accounts".into(),
                    skills: vec![
                        SkillEntry {
                            title: "Configure storage redundancy".into(),
                            description: String::new(),
                            urls: vec![],
                        },
                        SkillEntry {
                            title: "Quantum entanglement routing".into(),
                            description: String::new(),
                            urls: vec![],
                        },
                    ],
                }],
            }])
        }
    }

    struct NoSearch;

    #[async_trait]
    impl DocumentationSearch for NoSearch {
        async fn search(&self, _query: &str, _top: usize) -> Result<Vec<SearchHit>, ExternalError> {
            Ok(vec![])
        }
    }

    async fn service(catalog: FakeCatalog) -> (DiscoveryService, SqlitePool) {
        let pool = db::open_in_memory().await.unwrap();
        let sources = DiscoverySources {
            catalog: Arc::new(catalog),
            skills: Arc::new(FakeOutline),
            search: Arc::new(NoSearch),
        };
        let config = DiscoveryConfig {
            retry: RetryPolicy::immediate(2),
            ..Default::default()
        };
        (
            DiscoveryService::new(pool.clone(), EventBus::new(16), sources, config),
            pool,
        )
    }

    fn catalog() -> FakeCatalog {
        FakeCatalog {
            fail_groupings: false,
            unit_text: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn test_comprehensive_discovery() {
        let (service, pool) = service(catalog()).await;

        let result = service
            .discover("az-104", DiscoveryMode::Comprehensive)
            .await
            .unwrap();

        assert_eq!(result.topics.len(), 4);
        assert_eq!(result.gaps, vec!["skill:implement-storage/configure-storage-accounts/quantum-entanglement-routing"]);
        assert_eq!(result.confidence.score, 0.5);
        assert_eq!(result.delta.new_topics.len(), 3);

        let stored = db::discovery_runs::load_latest(&pool, "az-104")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.run_id, result.run_id);
    }

    #[tokio::test]
    async fn test_catalog_failure_aborts_without_publishing() {
        let mut failing = catalog();
        failing.fail_groupings = true;
        let (service, pool) = service(failing).await;

        let err = service
            .discover("az-104", DiscoveryMode::Deep)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Fetch { .. }));
        assert!(db::discovery_runs::load_latest(&pool, "az-104")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unit_text_failure_keeps_topic() {
        let flaky = catalog();
        flaky.unit_text.lock().unwrap().insert(
            "u-intro".into(),
            Err(ExternalError::Transient("reset".into())),
        );
        let (service, _pool) = service(flaky).await;

        let result = service.discover("az-104", DiscoveryMode::Deep).await.unwrap();

        let intro = result.topic("u-intro").unwrap();
        assert!(intro.fetch_failed);
        assert_eq!(intro.content_hash, None);
        assert_eq!(result.delta.fetch_error_count, 1);
        assert_eq!(result.confidence.score, 1.0);
    }
}
