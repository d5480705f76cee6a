//! Amendment Engine and plan ledger extension
//!
//! Each planning pass revises the persisted ledger of episode units:
//! 1. Amendment units for topics whose digest differs from the snapshot in
//!    the latest Episode Record covering them (`amendment_of` = that record)
//! 2. Ordinary units for topics no ledger unit covers yet (new topics and
//!    resolved gaps)
//!
//! Units with an Episode Record are never touched. A pending unit (planned,
//! no record yet) loses topics that left the discovery result; a pending unit
//! left empty frees its sequence number, which new units fill first and later
//! pending units close up, so numbering stays contiguous.

use super::episode_planner::{snapshot, EpisodePlanner, PlannerConfig};
use crate::db;
use crate::models::{DiscoveryResult, EpisodeRecord, EpisodeUnit, NarrationFormat, Topic};
use certaudio_common::Result;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Outcome of one planning pass over the ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerRevision {
    /// Full ledger after the pass, in sequence order
    pub ledger: Vec<EpisodeUnit>,
    /// Sequence numbers of pending rows to drop before writing
    pub retired: Vec<u32>,
    /// Units to write: new, narrowed or renumbered
    pub written: Vec<EpisodeUnit>,
}

impl LedgerRevision {
    pub fn is_unchanged(&self) -> bool {
        self.retired.is_empty() && self.written.is_empty()
    }
}

pub struct AmendmentEngine {
    planner: EpisodePlanner,
    topics_per_episode: usize,
}

impl AmendmentEngine {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            topics_per_episode: config.topics_per_episode.max(1),
            planner: EpisodePlanner::new(config),
        }
    }

    /// Revise `ledger` for this discovery result
    ///
    /// `ledger` and `records` belong to the result's subject and `format`.
    pub fn extend_plan(
        &self,
        result: &DiscoveryResult,
        format: NarrationFormat,
        ledger: &[EpisodeUnit],
        records: &[EpisodeRecord],
    ) -> LedgerRevision {
        let recorded: HashSet<u32> = records.iter().map(|r| r.sequence_number).collect();
        let mut fixed: Vec<EpisodeUnit> = Vec::new();
        // pending units by sequence number; the flag marks rows that must be written
        let mut pending: BTreeMap<u32, (EpisodeUnit, bool)> = BTreeMap::new();
        let mut retired = Vec::new();

        for unit in ledger {
            if recorded.contains(&unit.sequence_number) {
                fixed.push(unit.clone());
                continue;
            }
            let surviving: Vec<&String> = unit
                .topic_ids
                .iter()
                .filter(|id| result.topic(id).is_some_and(|t| !t.is_gap()))
                .collect();
            if surviving.len() == unit.topic_ids.len() {
                pending.insert(unit.sequence_number, (unit.clone(), false));
                continue;
            }

            retired.push(unit.sequence_number);
            if surviving.is_empty() {
                tracing::info!(
                    subject_id = %result.subject_id,
                    sequence_number = unit.sequence_number,
                    "Pending episode lost all its topics, releasing its sequence number"
                );
                continue;
            }
            let mut narrowed = unit.clone();
            narrowed.topic_ids = surviving.into_iter().cloned().collect();
            narrowed
                .topic_hashes
                .retain(|id, _| narrowed.topic_ids.contains(id));
            tracing::info!(
                subject_id = %result.subject_id,
                sequence_number = unit.sequence_number,
                topics = narrowed.topic_ids.len(),
                "Pending episode narrowed to its remaining topics"
            );
            pending.insert(unit.sequence_number, (narrowed, true));
        }

        let ledger_max = ledger.iter().map(|u| u.sequence_number).max().unwrap_or(0);
        let mut free: BTreeSet<u32> = (1..=ledger_max)
            .filter(|n| !recorded.contains(n) && !pending.contains_key(n))
            .collect();

        let current: Vec<EpisodeUnit> = fixed
            .iter()
            .chain(pending.values().map(|(u, _)| u))
            .cloned()
            .collect();
        let fresh = self.fresh_units(result, format, &current, records);
        let amendments = fresh.iter().filter(|u| u.amendment_of.is_some()).count();
        let new_units = fresh.len() - amendments;

        let mut next_sequence = ledger_max + 1;
        for mut unit in fresh {
            let slot = free.iter().copied().find(|&slot| fits(&unit, slot));
            unit.sequence_number = match slot {
                Some(slot) => {
                    free.remove(&slot);
                    slot
                }
                None => {
                    let sequence = next_sequence;
                    next_sequence += 1;
                    sequence
                }
            };
            pending.insert(unit.sequence_number, (unit, true));
        }

        // close remaining holes by moving later pending units down, keeping their order
        loop {
            let shift = free.iter().copied().find_map(|slot| {
                pending
                    .range(slot + 1..)
                    .find(|(_, (unit, _))| fits(unit, slot))
                    .map(|(&from, _)| (from, slot))
            });
            let Some((from, to)) = shift else {
                break;
            };
            let Some((mut unit, dirty)) = pending.remove(&from) else {
                break;
            };
            if !dirty {
                retired.push(from);
            }
            unit.sequence_number = to;
            free.remove(&to);
            free.insert(from);
            pending.insert(to, (unit, true));
        }

        let written: Vec<EpisodeUnit> = pending
            .values()
            .filter(|(_, dirty)| *dirty)
            .map(|(u, _)| u.clone())
            .collect();
        let mut revised: Vec<EpisodeUnit> = fixed
            .into_iter()
            .chain(pending.into_values().map(|(u, _)| u))
            .collect();
        revised.sort_by_key(|u| u.sequence_number);
        retired.sort_unstable();

        tracing::info!(
            subject_id = %result.subject_id,
            format = %format,
            existing_units = ledger.len(),
            amendments,
            new_units,
            retired = retired.len(),
            "Extended episode plan"
        );
        LedgerRevision {
            ledger: revised,
            retired,
            written,
        }
    }

    /// Amendments, then ordinary units for uncovered topics; numbers are provisional
    fn fresh_units(
        &self,
        result: &DiscoveryResult,
        format: NarrationFormat,
        ledger: &[EpisodeUnit],
        records: &[EpisodeRecord],
    ) -> Vec<EpisodeUnit> {
        let mut units = Vec::new();
        for (prior, topics) in self.changed_topics(result, ledger, records).into_values() {
            for part in topics.chunks(self.topics_per_episode) {
                units.push(EpisodeUnit {
                    subject_id: result.subject_id.clone(),
                    format,
                    sequence_number: 0,
                    group_title: prior.group_title.clone(),
                    topic_ids: part.iter().map(|t| t.id.clone()).collect(),
                    topic_hashes: snapshot(part),
                    amendment_of: Some(prior.sequence_number),
                    instruction: Some(amendment_instruction(prior, part)),
                });
            }
        }

        let covered: HashSet<&str> = ledger
            .iter()
            .flat_map(|u| u.topic_ids.iter().map(String::as_str))
            .collect();
        let uncovered: Vec<Topic> = result
            .topics
            .iter()
            .filter(|t| !covered.contains(t.id.as_str()))
            .cloned()
            .collect();
        units.extend(self.planner.plan(&result.subject_id, format, &uncovered, 1));
        units
    }

    /// Changed topics grouped by the record they amend, in record order
    fn changed_topics<'a>(
        &self,
        result: &'a DiscoveryResult,
        ledger: &[EpisodeUnit],
        records: &'a [EpisodeRecord],
    ) -> BTreeMap<u32, (&'a EpisodeRecord, Vec<&'a Topic>)> {
        let mut changed: BTreeMap<u32, (&EpisodeRecord, Vec<&Topic>)> = BTreeMap::new();

        for topic in result.topics.iter().filter(|t| !t.is_gap()) {
            let Some(current) = topic.content_hash.as_deref() else {
                continue;
            };
            let Some(latest) = records
                .iter()
                .filter(|r| r.topic_hashes.contains_key(&topic.id))
                .max_by_key(|r| r.sequence_number)
            else {
                continue;
            };
            if latest.topic_hashes.get(&topic.id).map(String::as_str) == Some(current) {
                continue;
            }

            // an amendment for this exact content may be planned but not generated yet
            let already_planned = ledger.iter().any(|u| {
                u.sequence_number > latest.sequence_number
                    && u.topic_hashes.get(&topic.id).map(String::as_str) == Some(current)
            });
            if already_planned {
                continue;
            }

            tracing::debug!(
                topic = %topic.id,
                prior_episode = latest.sequence_number,
                "Topic changed since its episode was generated"
            );
            changed
                .entry(latest.sequence_number)
                .or_insert_with(|| (latest, Vec::new()))
                .1
                .push(topic);
        }

        changed
    }
}

/// An amendment must come after the episode it amends
fn fits(unit: &EpisodeUnit, slot: u32) -> bool {
    unit.amendment_of.map_or(true, |prior| slot > prior)
}

fn amendment_instruction(prior: &EpisodeRecord, topics: &[&Topic]) -> String {
    let titles: Vec<&str> = topics.iter().map(|t| t.title.as_str()).collect();
    format!(
        "In a previous episode (episode {}, \"{}\") we covered {}. The source material \
         has since changed. Briefly reference the earlier coverage, then explain what \
         is new or different now.",
        prior.sequence_number,
        prior.title,
        titles.join(", ")
    )
}

/// Revise and persist the plan ledger for one subject+format
///
/// Returns the full ledger in sequence order.
pub async fn extend_ledger(
    pool: &SqlitePool,
    engine: &AmendmentEngine,
    result: &DiscoveryResult,
    format: NarrationFormat,
) -> Result<Vec<EpisodeUnit>> {
    let ledger = db::units::load_units(pool, &result.subject_id, format).await?;
    let records = db::episodes::load_records(pool, &result.subject_id, format).await?;

    let revision = engine.extend_plan(result, format, &ledger, &records);
    if !revision.is_unchanged() {
        db::units::revise_units(
            pool,
            &result.subject_id,
            format,
            &revision.retired,
            &revision.written,
        )
        .await?;
    }
    Ok(revision.ledger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ConfidenceReport, ContentDelta, CoverageBreakdown, DiscoveryMode, Grade, OriginKind,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn topic(id: &str, module: &str, hash: &str) -> Topic {
        Topic {
            id: id.into(),
            title: format!("Title {}", id),
            origin_kind: OriginKind::PathModule,
            parent_grouping: module.into(),
            parent_key: module.into(),
            domain: "Path".into(),
            reference_text: "text".into(),
            source_urls: vec![],
            content_hash: Some(hash.into()),
            low_priority: false,
            fetch_failed: false,
            outline_urls: vec![],
            coverage: None,
        }
    }

    fn result(topics: Vec<Topic>) -> DiscoveryResult {
        DiscoveryResult {
            run_id: Uuid::new_v4(),
            subject_id: "az-104".into(),
            mode: DiscoveryMode::Deep,
            topics,
            confidence: ConfidenceReport {
                score: 1.0,
                grade: Grade::A,
                exam_skill_topics: 0,
                module_topics: 0,
                breakdown: CoverageBreakdown::default(),
                per_objective: vec![],
                supplemental_urls: vec![],
            },
            gaps: vec![],
            delta: ContentDelta::default(),
            created_at: Utc::now(),
        }
    }

    fn record_for(unit: &EpisodeUnit) -> EpisodeRecord {
        EpisodeRecord {
            id: unit.episode_id(),
            subject_id: unit.subject_id.clone(),
            format: unit.format,
            sequence_number: unit.sequence_number,
            title: unit.title(),
            group_title: unit.group_title.clone(),
            topic_ids: unit.topic_ids.clone(),
            topic_hashes: unit.topic_hashes.clone(),
            content_hash: "c".into(),
            audio_url: "a".into(),
            script_url: "s".into(),
            markup_url: "m".into(),
            duration_seconds: 1.0,
            word_count: 1,
            amendment_of: unit.amendment_of,
            source_urls: vec![],
            created_at: Utc::now(),
        }
    }

    fn engine() -> AmendmentEngine {
        AmendmentEngine::new(PlannerConfig::default())
    }

    fn engine_with_limit(topics_per_episode: usize) -> AmendmentEngine {
        AmendmentEngine::new(PlannerConfig {
            topics_per_episode,
            ..Default::default()
        })
    }

    fn plan(
        discovery: &DiscoveryResult,
        ledger: &[EpisodeUnit],
        records: &[EpisodeRecord],
    ) -> LedgerRevision {
        engine().extend_plan(discovery, NarrationFormat::Instructional, ledger, records)
    }

    fn sequences(units: &[EpisodeUnit]) -> Vec<u32> {
        units.iter().map(|u| u.sequence_number).collect()
    }

    #[test]
    fn test_first_pass_plans_everything() {
        let discovery = result(vec![topic("a", "A", "h1"), topic("b", "B", "h2")]);
        let revision = plan(&discovery, &[], &[]);
        assert_eq!(revision.written.len(), 1);
        assert_eq!(revision.written[0].sequence_number, 1);
        assert_eq!(revision.written[0].amendment_of, None);
        assert!(revision.retired.is_empty());
        assert_eq!(revision.ledger, revision.written);
    }

    #[test]
    fn test_changed_topic_becomes_amendment() {
        let first = result(vec![topic("a", "A", "h1"), topic("b", "A", "h2")]);
        let ledger = plan(&first, &[], &[]).ledger;
        let records: Vec<EpisodeRecord> = ledger.iter().map(record_for).collect();

        let second = result(vec![topic("a", "A", "h1-edited"), topic("b", "A", "h2")]);
        let revision = plan(&second, &ledger, &records);

        assert_eq!(revision.written.len(), 1);
        let amendment = &revision.written[0];
        assert_eq!(amendment.sequence_number, 2);
        assert_eq!(amendment.amendment_of, Some(1));
        assert_eq!(amendment.topic_ids, vec!["a"]);
        assert_eq!(amendment.title(), "Update: A");
        assert!(amendment
            .instruction
            .as_deref()
            .unwrap()
            .contains("episode 1"));
        assert_eq!(revision.ledger[0], ledger[0]);
    }

    #[test]
    fn test_pending_amendment_not_duplicated() {
        let first = result(vec![topic("a", "A", "h1")]);
        let ledger = plan(&first, &[], &[]).ledger;
        let records: Vec<EpisodeRecord> = ledger.iter().map(record_for).collect();

        let second = result(vec![topic("a", "A", "h1-edited")]);
        let ledger = plan(&second, &ledger, &records).ledger;

        let again = plan(&second, &ledger, &records);
        assert!(again.is_unchanged());
        assert_eq!(again.ledger, ledger);
    }

    #[test]
    fn test_unplanned_topic_not_amended() {
        // planned but never generated: no record, so no amendment framing
        let first = result(vec![topic("a", "A", "h1")]);
        let ledger = plan(&first, &[], &[]).ledger;

        let second = result(vec![topic("a", "A", "h1-edited"), topic("n", "N", "h9")]);
        let revision = plan(&second, &ledger, &[]);

        assert_eq!(revision.written.len(), 1);
        assert_eq!(revision.written[0].topic_ids, vec!["n"]);
        assert_eq!(revision.written[0].amendment_of, None);
        assert_eq!(revision.written[0].sequence_number, 2);
    }

    #[test]
    fn test_emptied_pending_unit_slot_is_refilled() {
        let first = result(vec![topic("a", "A", "h1"), topic("b", "B", "h2")]);
        let ledger = engine_with_limit(1).extend_plan(&first, NarrationFormat::Instructional, &[], &[]).ledger;
        assert_eq!(sequences(&ledger), vec![1, 2]);
        let records = vec![record_for(&ledger[0])];

        // b left the catalog before episode 2 was generated; c takes its number
        let second = result(vec![topic("a", "A", "h1"), topic("c", "C", "h3")]);
        let revision =
            engine_with_limit(1).extend_plan(&second, NarrationFormat::Instructional, &ledger, &records);

        assert_eq!(revision.retired, vec![2]);
        assert_eq!(revision.written.len(), 1);
        assert_eq!(revision.written[0].sequence_number, 2);
        assert_eq!(revision.written[0].topic_ids, vec!["c"]);
        assert_eq!(sequences(&revision.ledger), vec![1, 2]);
    }

    #[test]
    fn test_later_pending_units_close_the_hole() {
        let first = result(vec![
            topic("a", "A", "h1"),
            topic("b", "B", "h2"),
            topic("c", "C", "h3"),
        ]);
        let ledger = engine_with_limit(1).extend_plan(&first, NarrationFormat::Instructional, &[], &[]).ledger;
        let records = vec![record_for(&ledger[0])];

        let second = result(vec![topic("a", "A", "h1"), topic("c", "C", "h3")]);
        let revision =
            engine_with_limit(1).extend_plan(&second, NarrationFormat::Instructional, &ledger, &records);

        assert_eq!(revision.retired, vec![2, 3]);
        assert_eq!(sequences(&revision.ledger), vec![1, 2]);
        assert_eq!(revision.ledger[1].topic_ids, vec!["c"]);
        assert_eq!(revision.written, vec![revision.ledger[1].clone()]);
    }

    #[test]
    fn test_pending_unit_narrowed_in_place() {
        let first = result(vec![topic("a", "A", "h1"), topic("b", "A", "h2")]);
        let ledger = plan(&first, &[], &[]).ledger;

        let second = result(vec![topic("a", "A", "h1")]);
        let revision = plan(&second, &ledger, &[]);

        assert_eq!(revision.retired, vec![1]);
        assert_eq!(revision.ledger.len(), 1);
        assert_eq!(revision.ledger[0].sequence_number, 1);
        assert_eq!(revision.ledger[0].topic_ids, vec!["a"]);
        assert!(!revision.ledger[0].topic_hashes.contains_key("b"));
    }

    #[test]
    fn test_recorded_units_never_revised() {
        let first = result(vec![topic("a", "A", "h1"), topic("b", "B", "h2")]);
        let ledger = engine_with_limit(1).extend_plan(&first, NarrationFormat::Instructional, &[], &[]).ledger;
        let records: Vec<EpisodeRecord> = ledger.iter().map(record_for).collect();

        let second = result(vec![topic("a", "A", "h1")]);
        let revision =
            engine_with_limit(1).extend_plan(&second, NarrationFormat::Instructional, &ledger, &records);

        assert!(revision.is_unchanged());
        assert_eq!(revision.ledger, ledger);
    }

    #[tokio::test]
    async fn test_extend_ledger_persists_once() {
        let pool = db::open_in_memory().await.unwrap();
        let discovery = result(vec![topic("a", "A", "h1")]);

        let ledger = extend_ledger(&pool, &engine(), &discovery, NarrationFormat::Instructional)
            .await
            .unwrap();
        let again = extend_ledger(&pool, &engine(), &discovery, NarrationFormat::Instructional)
            .await
            .unwrap();

        assert_eq!(ledger, again);
        assert_eq!(again.len(), 1);
    }
}
