//! Coverage Reconciler
//!
//! Gives every exam-skill topic a best-effort reference text by walking an
//! ordered fallback chain, stopping at the first success:
//! 1. title match against module/unit titles in the merged graph (1.0)
//! 2. token overlap with module descriptions (0.8)
//! 3. external documentation search by skill title (0.5)
//! 4. gap (0.0): reference text and source URLs stay empty
//!
//! Reconciliation only annotates topics; the topic count never changes.

use super::doc_search_client::{DocumentationSearch, SearchHit};
use super::topic_merger::MergedGraph;
use crate::models::{
    ConfidenceReport, Coverage, CoverageBreakdown, Grade, MatchSource, ObjectiveScore, OriginKind,
    Topic,
};
use crate::utils::text::{normalize_title, significant_tokens};
use crate::utils::{with_retry, RetryPolicy};
use std::collections::HashSet;
use std::sync::Arc;

/// Matching thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageConfig {
    /// Minimum Sørensen-Dice similarity of normalized titles
    pub title_match_threshold: f64,
    /// Minimum share of skill tokens found in a module title + summary
    pub description_match_threshold: f64,
    /// Search hits used for one skill
    pub search_top: usize,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            title_match_threshold: 0.45,
            description_match_threshold: 0.6,
            search_top: 3,
        }
    }
}

/// Similarity of two titles after normalization, 0.0 to 1.0
///
/// Containment of one normalized title in the other counts as a full match.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if short.len() >= 4 && format!(" {} ", long).contains(&format!(" {} ", short)) {
        return 1.0;
    }
    strsim::sorensen_dice(&a, &b)
}

/// Share of `tokens` present in `text`
pub fn token_overlap(tokens: &HashSet<String>, text: &str) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let other = significant_tokens(text);
    tokens.intersection(&other).count() as f64 / tokens.len() as f64
}

struct TitleCandidate {
    title: String,
    text: String,
    urls: Vec<String>,
    /// Some unit text behind this candidate failed to fetch
    incomplete: bool,
}

/// Step-1 candidates: every unit with text or a failed fetch, and every
/// module (all unit texts joined)
fn title_candidates(topics: &[Topic]) -> Vec<TitleCandidate> {
    let mut candidates = Vec::new();
    let mut module_order: Vec<&str> = Vec::new();

    for topic in topics.iter().filter(|t| t.origin_kind == OriginKind::PathModule) {
        if topic.fetch_failed || !topic.reference_text.trim().is_empty() {
            candidates.push(TitleCandidate {
                title: topic.title.clone(),
                text: topic.reference_text.clone(),
                urls: topic.source_urls.clone(),
                incomplete: topic.fetch_failed,
            });
        }
        if !module_order.contains(&topic.parent_key.as_str()) {
            module_order.push(topic.parent_key.as_str());
        }
    }

    for key in module_order {
        let units: Vec<&Topic> = topics
            .iter()
            .filter(|t| t.origin_kind == OriginKind::PathModule && t.parent_key == key)
            .collect();
        let text = units
            .iter()
            .map(|t| t.reference_text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let incomplete = units.iter().any(|t| t.fetch_failed);
        if text.is_empty() && !incomplete {
            continue;
        }
        let mut urls: Vec<String> = Vec::new();
        for url in units.iter().flat_map(|t| t.source_urls.iter()) {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        candidates.push(TitleCandidate {
            title: units[0].parent_grouping.clone(),
            text,
            urls,
            incomplete,
        });
    }
    candidates
}

fn search_reference_text(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| format!("## {}\n\n{}", h.title, h.snippet.trim()))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Runs the fallback chain over a merged graph
pub struct CoverageReconciler {
    search: Arc<dyn DocumentationSearch>,
    retry: RetryPolicy,
    config: CoverageConfig,
}

impl CoverageReconciler {
    pub fn new(
        search: Arc<dyn DocumentationSearch>,
        retry: RetryPolicy,
        config: CoverageConfig,
    ) -> Self {
        Self {
            search,
            retry,
            config,
        }
    }

    /// Annotate every exam-skill topic with coverage and reference text
    pub async fn reconcile(&self, graph: MergedGraph) -> Vec<Topic> {
        let candidates = title_candidates(&graph.topics);
        let mut topics = graph.topics;
        let total = topics.len();

        for topic in topics
            .iter_mut()
            .filter(|t| t.origin_kind == OriginKind::ExamSkill)
        {
            // Step 1: title match
            let best_title = candidates
                .iter()
                .map(|c| (title_similarity(&topic.title, &c.title), c))
                .filter(|(score, _)| *score >= self.config.title_match_threshold)
                .fold(None::<(f64, &TitleCandidate)>, |best, (score, c)| match best {
                    Some((s, _)) if s >= score => best,
                    _ => Some((score, c)),
                });
            if let Some((score, candidate)) = best_title {
                tracing::debug!(topic = %topic.id, matched = %candidate.title, score, "Title match");
                topic.reference_text = candidate.text.clone();
                // partial text must not read as an upstream edit
                topic.fetch_failed = candidate.incomplete;
                for url in &candidate.urls {
                    topic.add_source_url(url);
                }
                annotate(topic, MatchSource::TitleMatch, &candidate.title);
                continue;
            }

            // Step 2: module description overlap
            let mut skill_text = topic.title.clone();
            if let Some(description) = graph.skill_descriptions.get(&topic.id) {
                skill_text.push(' ');
                skill_text.push_str(description);
            }
            let tokens = significant_tokens(&skill_text);
            let best_module = graph
                .modules
                .iter()
                .map(|m| {
                    let text = format!("{} {}", m.title, m.summary);
                    (token_overlap(&tokens, &text), m)
                })
                .filter(|(overlap, _)| *overlap >= self.config.description_match_threshold)
                .fold(None, |best: Option<(f64, _)>, (overlap, m)| match best {
                    Some((o, _)) if o >= overlap => best,
                    _ => Some((overlap, m)),
                });
            if let Some((overlap, module)) = best_module {
                tracing::debug!(topic = %topic.id, module = %module.title, overlap, "Description match");
                topic.reference_text = if module.summary.trim().is_empty() {
                    module.title.clone()
                } else {
                    format!("{}\n\n{}", module.title, module.summary.trim())
                };
                topic.add_source_url(&module.url);
                annotate(topic, MatchSource::DescriptionMatch, &module.title);
                continue;
            }

            // Step 3: documentation search
            let query = topic.title.clone();
            let hits = with_retry(&self.retry, "documentation_search", || {
                self.search.search(&query, self.config.search_top)
            })
            .await;
            match hits {
                Ok(hits) if !hits.is_empty() => {
                    topic.reference_text = search_reference_text(&hits);
                    for hit in &hits {
                        topic.add_source_url(&hit.url);
                    }
                    let first = hits[0].title.clone();
                    annotate(topic, MatchSource::DocumentationSearch, &first);
                }
                Ok(_) => {
                    tracing::info!(topic = %topic.id, "No coverage found, recording gap");
                    topic.coverage = Some(Coverage::gap());
                }
                Err(e) => {
                    tracing::warn!(topic = %topic.id, error = %e, "Documentation search failed, recording gap");
                    topic.coverage = Some(Coverage::gap());
                }
            }
        }

        debug_assert_eq!(topics.len(), total);
        topics
    }
}

fn annotate(topic: &mut Topic, source: MatchSource, matched: &str) {
    for url in topic.outline_urls.clone() {
        topic.add_source_url(&url);
    }
    topic.coverage = Some(Coverage {
        source,
        matched: Some(matched.to_string()),
    });
}

/// Confidence score, grade, breakdown and per-objective scores
///
/// Module topics are authoritative and excluded from the denominator. A graph
/// without exam skills scores 1.0, or 0.0 when empty.
pub fn compute_confidence(topics: &[Topic]) -> ConfidenceReport {
    let skills: Vec<&Topic> = topics
        .iter()
        .filter(|t| t.origin_kind == OriginKind::ExamSkill)
        .collect();
    let module_topics = topics.len() - skills.len();

    let mut breakdown = CoverageBreakdown::default();
    let mut supplemental_urls: Vec<String> = Vec::new();
    let mut objectives: Vec<(String, f64, usize, usize)> = Vec::new();

    for topic in &skills {
        let source = topic
            .coverage
            .as_ref()
            .map(|c| c.source)
            .unwrap_or(MatchSource::Gap);
        match source {
            MatchSource::TitleMatch => breakdown.title_match += 1,
            MatchSource::DescriptionMatch => breakdown.description_match += 1,
            MatchSource::DocumentationSearch => breakdown.documentation_search += 1,
            MatchSource::Gap => breakdown.gap += 1,
        }
        if matches!(
            source,
            MatchSource::DescriptionMatch | MatchSource::DocumentationSearch
        ) {
            for url in &topic.source_urls {
                if !supplemental_urls.contains(url) {
                    supplemental_urls.push(url.clone());
                }
            }
        }

        let gap = usize::from(source == MatchSource::Gap);
        match objectives
            .iter_mut()
            .find(|(name, ..)| *name == topic.parent_grouping)
        {
            Some(entry) => {
                entry.1 += source.weight();
                entry.2 += 1;
                entry.3 += gap;
            }
            None => objectives.push((topic.parent_grouping.clone(), source.weight(), 1, gap)),
        }
    }

    let score = if skills.is_empty() {
        if topics.is_empty() {
            0.0
        } else {
            1.0
        }
    } else {
        let covered: f64 = skills
            .iter()
            .map(|t| t.coverage_weight().unwrap_or(0.0))
            .sum();
        covered / skills.len() as f64
    };

    ConfidenceReport {
        score,
        grade: Grade::from_score(score),
        exam_skill_topics: skills.len(),
        module_topics,
        breakdown,
        per_objective: objectives
            .into_iter()
            .map(|(objective, weight, count, gaps)| ObjectiveScore {
                objective,
                score: weight / count as f64,
                topic_count: count,
                gap_count: gaps,
            })
            .collect(),
        supplemental_urls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalError;
    use crate::services::topic_merger::ModuleSummary;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSearch {
        hits: HashMap<String, Vec<SearchHit>>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentationSearch for FakeSearch {
        async fn search(&self, query: &str, top: usize) -> Result<Vec<SearchHit>, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ExternalError::ServiceUnavailable("down".into()));
            }
            let mut hits = self.hits.get(query).cloned().unwrap_or_default();
            hits.truncate(top);
            Ok(hits)
        }
    }

    fn search(hits: Vec<(&str, Vec<SearchHit>)>, fail: bool) -> Arc<FakeSearch> {
        Arc::new(FakeSearch {
            hits: hits.into_iter().map(|(q, h)| (q.to_string(), h)).collect(),
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    fn module_topic(id: &str, title: &str, module: &str, text: &str) -> Topic {
        Topic {
            id: id.into(),
            title: title.into(),
            origin_kind: OriginKind::PathModule,
            parent_grouping: module.into(),
            parent_key: format!("m-{}", module),
            domain: "Path".into(),
            reference_text: text.into(),
            source_urls: vec![format!("https://learn/{}", id)],
            content_hash: None,
            low_priority: false,
            fetch_failed: false,
            outline_urls: vec![],
            coverage: None,
        }
    }

    fn skill_topic(title: &str) -> Topic {
        Topic {
            id: format!("skill:d/o/{}", title),
            title: title.into(),
            origin_kind: OriginKind::ExamSkill,
            parent_grouping: "Domain: Objective".into(),
            parent_key: "skill:d/o".into(),
            domain: "Domain".into(),
            reference_text: String::new(),
            source_urls: vec![],
            content_hash: None,
            low_priority: false,
            fetch_failed: false,
            outline_urls: vec!["https://outline/link".into()],
            coverage: None,
        }
    }

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: title.into(),
            url: format!("https://docs/{}", title.replace(' ', "-")),
            snippet: format!("About {}", title),
        }
    }

    #[test]
    fn test_title_similarity() {
        assert_eq!(title_similarity("Create users", "Create users and groups"), 1.0);
        assert!(title_similarity("Configure virtual networks", "Configure virtual network peering") > 0.45);
        assert!(title_similarity("Manage costs", "Deploy containers") < 0.45);
        assert_eq!(title_similarity("", "anything"), 0.0);
    }

    #[tokio::test]
    async fn test_fallback_chain_order() {
        let graph = MergedGraph {
            topics: vec![
                module_topic("u1", "Create users and groups", "Identity basics", "Users live in Entra."),
                skill_topic("Create users"),
                skill_topic("Implement backup vault policies"),
                skill_topic("Interpret monitoring metrics"),
                skill_topic("Operate quantum annealers"),
            ],
            modules: vec![ModuleSummary {
                uid: "m-backup".into(),
                title: "Protect workloads".into(),
                summary: "Implement backup vault and policies for virtual machines".into(),
                url: "https://learn/modules/backup".into(),
            }],
            skill_descriptions: HashMap::new(),
            merged_duplicates: 0,
        };
        let fake = search(vec![("Interpret monitoring metrics", vec![hit("Metrics overview")])], false);
        let reconciler = CoverageReconciler::new(
            fake.clone(),
            RetryPolicy::immediate(2),
            CoverageConfig::default(),
        );

        let topics = reconciler.reconcile(graph).await;
        assert_eq!(topics.len(), 5);

        let sources: Vec<Option<MatchSource>> = topics
            .iter()
            .map(|t| t.coverage.as_ref().map(|c| c.source))
            .collect();
        assert_eq!(
            sources,
            vec![
                None,
                Some(MatchSource::TitleMatch),
                Some(MatchSource::DescriptionMatch),
                Some(MatchSource::DocumentationSearch),
                Some(MatchSource::Gap),
            ]
        );

        assert_eq!(topics[1].reference_text, "Users live in Entra.");
        assert_eq!(
            topics[1].source_urls,
            vec!["https://learn/u1", "https://outline/link"]
        );
        assert!(topics[3].reference_text.contains("## Metrics overview"));
        assert!(topics[4].reference_text.is_empty());
        assert!(topics[4].source_urls.is_empty());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_search_failure_records_gap() {
        let graph = MergedGraph {
            topics: vec![skill_topic("Design for resiliency")],
            ..Default::default()
        };
        let fake = search(vec![], true);
        let reconciler = CoverageReconciler::new(
            fake.clone(),
            RetryPolicy::immediate(3),
            CoverageConfig::default(),
        );

        let topics = reconciler.reconcile(graph).await;
        assert!(topics[0].is_gap());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_match_on_partially_fetched_module_is_marked_failed() {
        let mut missing = module_topic("u2", "Storage tiers", "Storage accounts", "");
        missing.fetch_failed = true;
        let graph = MergedGraph {
            topics: vec![
                module_topic("u1", "Storage redundancy", "Storage accounts", "Copies live in zones."),
                missing,
                skill_topic("Storage accounts"),
            ],
            ..Default::default()
        };
        let reconciler = CoverageReconciler::new(
            search(vec![], false),
            RetryPolicy::immediate(1),
            CoverageConfig::default(),
        );

        let topics = reconciler.reconcile(graph).await;
        let skill = &topics[2];
        assert_eq!(skill.coverage.as_ref().map(|c| c.source), Some(MatchSource::TitleMatch));
        assert!(skill.fetch_failed);
    }

    #[test]
    fn test_confidence_weights_and_grades() {
        let mut topics = vec![module_topic("u1", "Intro", "M", "text")];
        for (i, source) in [
            MatchSource::TitleMatch,
            MatchSource::DescriptionMatch,
            MatchSource::DocumentationSearch,
            MatchSource::Gap,
        ]
        .into_iter()
        .enumerate()
        {
            let mut skill = skill_topic(&format!("skill {}", i));
            skill.coverage = Some(Coverage {
                source,
                matched: None,
            });
            topics.push(skill);
        }

        let report = compute_confidence(&topics);
        assert!((report.score - 0.575).abs() < 1e-9);
        assert_eq!(report.grade, Grade::D);
        assert_eq!(report.exam_skill_topics, 4);
        assert_eq!(report.module_topics, 1);
        assert_eq!(report.breakdown.gap, 1);
        assert_eq!(report.per_objective.len(), 1);
        assert_eq!(report.per_objective[0].gap_count, 1);
    }

    #[test]
    fn test_confidence_without_skills() {
        assert_eq!(compute_confidence(&[]).score, 0.0);
        let topics = vec![module_topic("u1", "Intro", "M", "text")];
        let report = compute_confidence(&topics);
        assert_eq!(report.score, 1.0);
        assert_eq!(report.grade, Grade::A);
    }
}
