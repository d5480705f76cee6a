//! Topic Merger & Deduplicator
//!
//! Unions the learning-path catalog and the exam skill outline into one topic
//! graph. Modules are keyed by UID: a module listed under several learning
//! paths is merged into its first occurrence. Exam skills are never
//! deduplicated against modules; a module discussing a skill is not a
//! substitute for it.

use super::catalog_client::{CatalogGrouping, CatalogUnit, SkillDomain};
use crate::error::DiscoveryError;
use crate::models::{OriginKind, Topic};
use crate::utils::text::slugify;
use std::collections::{HashMap, HashSet};

const LOW_PRIORITY_KINDS: &[&str] = &[
    "exercise",
    "summary",
    "knowledge-check",
    "knowledge_check",
    "assessment",
    "lab",
];

const LOW_PRIORITY_PHRASES: &[&str] = &[
    "exercise",
    "summary",
    "knowledge check",
    "module assessment",
    "lab",
];

/// Reference text fetch outcome for one unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitText {
    Fetched(String),
    /// Fetch failed after retries; the stored digest is kept
    Failed,
}

/// Module as seen by coverage reconciliation (description search)
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSummary {
    pub uid: String,
    pub title: String,
    pub summary: String,
    pub url: String,
}

/// Pre-reconciliation topic graph
#[derive(Debug, Clone, Default)]
pub struct MergedGraph {
    /// Module topics in catalog order, then exam-skill topics in outline order
    pub topics: Vec<Topic>,
    /// Distinct modules, first occurrence order
    pub modules: Vec<ModuleSummary>,
    /// Skill descriptions keyed by topic id
    pub skill_descriptions: HashMap<String, String>,
    /// Module occurrences folded into an earlier one
    pub merged_duplicates: usize,
}

/// Exercise/summary/knowledge-check classification
pub fn is_low_priority(unit: &CatalogUnit) -> bool {
    match unit.kind.as_deref() {
        Some(kind) => LOW_PRIORITY_KINDS.contains(&kind.trim().to_ascii_lowercase().as_str()),
        None => {
            let title = unit.title.to_ascii_lowercase();
            LOW_PRIORITY_PHRASES
                .iter()
                .any(|phrase| contains_words(&title, phrase))
        }
    }
}

/// Whole-word phrase containment ("lab" must not match "label")
fn contains_words(haystack: &str, phrase: &str) -> bool {
    let words: Vec<&str> = haystack
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let needle: Vec<&str> = phrase.split(' ').collect();
    words.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Stable id of an exam-skill topic
pub fn skill_topic_id(domain: &str, objective: &str, skill: &str) -> String {
    format!(
        "skill:{}/{}/{}",
        slugify(domain),
        slugify(objective),
        slugify(skill)
    )
}

struct ModuleEntry {
    summary: ModuleSummary,
    grouping_title: String,
    units: Vec<CatalogUnit>,
}

/// Merge both catalogs into one graph
///
/// `unit_texts` holds the fetched reference text per unit UID; units missing
/// from the map are treated as failed fetches.
pub fn merge(
    groupings: &[CatalogGrouping],
    unit_texts: &HashMap<String, UnitText>,
    outline: &[SkillDomain],
) -> Result<MergedGraph, DiscoveryError> {
    let mut entries: Vec<ModuleEntry> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut merged_duplicates = 0;

    for grouping in groupings {
        for module in &grouping.modules {
            match index.get(module.uid.as_str()) {
                Some(&idx) => {
                    merged_duplicates += 1;
                    let entry = &mut entries[idx];
                    for unit in &module.units {
                        if !entry.units.iter().any(|u| u.uid == unit.uid) {
                            entry.units.push(unit.clone());
                        }
                    }
                    tracing::debug!(
                        module_uid = %module.uid,
                        grouping = %grouping.title,
                        "Merged duplicate module into first occurrence"
                    );
                }
                None => {
                    index.insert(module.uid.as_str(), entries.len());
                    entries.push(ModuleEntry {
                        summary: ModuleSummary {
                            uid: module.uid.clone(),
                            title: module.title.clone(),
                            summary: module.summary.clone(),
                            url: module.url.clone(),
                        },
                        grouping_title: grouping.title.clone(),
                        units: module.units.clone(),
                    });
                }
            }
        }
    }

    let mut topics = Vec::new();
    for entry in &entries {
        for unit in &entry.units {
            let (reference_text, fetch_failed) = match unit_texts.get(&unit.uid) {
                Some(UnitText::Fetched(text)) => (text.clone(), false),
                Some(UnitText::Failed) | None => (String::new(), true),
            };
            let mut topic = Topic {
                id: unit.uid.clone(),
                title: unit.title.clone(),
                origin_kind: OriginKind::PathModule,
                parent_grouping: entry.summary.title.clone(),
                parent_key: entry.summary.uid.clone(),
                domain: entry.grouping_title.clone(),
                reference_text,
                source_urls: Vec::new(),
                content_hash: None,
                low_priority: is_low_priority(unit),
                fetch_failed,
                outline_urls: Vec::new(),
                coverage: None,
            };
            topic.add_source_url(&unit.url);
            topic.add_source_url(&entry.summary.url);
            topics.push(topic);
        }
    }

    let mut skill_descriptions = HashMap::new();
    for domain in outline {
        for objective in &domain.objectives {
            let parent_key = format!(
                "skill:{}/{}",
                slugify(&domain.name),
                slugify(&objective.name)
            );
            for skill in &objective.skills {
                let id = skill_topic_id(&domain.name, &objective.name, &skill.title);
                if !skill.description.trim().is_empty() {
                    skill_descriptions.insert(id.clone(), skill.description.clone());
                }
                topics.push(Topic {
                    id,
                    title: skill.title.clone(),
                    origin_kind: OriginKind::ExamSkill,
                    parent_grouping: format!("{}: {}", domain.name, objective.name),
                    parent_key: parent_key.clone(),
                    domain: domain.name.clone(),
                    reference_text: String::new(),
                    source_urls: Vec::new(),
                    content_hash: None,
                    low_priority: false,
                    fetch_failed: false,
                    outline_urls: skill.urls.clone(),
                    coverage: None,
                });
            }
        }
    }

    validate(&topics)?;

    tracing::info!(
        modules = entries.len(),
        merged_duplicates,
        topics = topics.len(),
        "Merged catalogs"
    );

    Ok(MergedGraph {
        topics,
        modules: entries.into_iter().map(|e| e.summary).collect(),
        skill_descriptions,
        merged_duplicates,
    })
}

/// Integrity check: unique ids and a grouping on every topic
pub fn validate(topics: &[Topic]) -> Result<(), DiscoveryError> {
    let mut seen = HashSet::with_capacity(topics.len());
    for topic in topics {
        if !seen.insert(topic.id.as_str()) {
            return Err(DiscoveryError::DuplicateTopicId(topic.id.clone()));
        }
        if topic.parent_grouping.trim().is_empty() || topic.parent_key.trim().is_empty() {
            return Err(DiscoveryError::MissingGrouping(topic.id.clone()));
        }
    }
    Ok(())
}
