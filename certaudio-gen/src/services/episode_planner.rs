//! Episode Planner
//!
//! Groups topics, in catalog order, into episode units of at most
//! `topics_per_episode` topics and assigns consecutive sequence numbers.
//!
//! **Grouping rules:**
//! - Consecutive topics sharing an origin kind and parent key form one group
//!   (a module's units, or the skills of one exam objective)
//! - A group that fits in the current unit is never split
//! - A group larger than the limit becomes `"<title> (Part N)"` units
//! - Module topics and exam-skill topics never share a unit
//! - Gap topics are not planned
//!
//! Planning is a pure function of its input: the same topics and
//! configuration always produce the same units and numbers.

use crate::models::{EpisodeUnit, NarrationFormat, OriginKind, Topic};
use std::collections::BTreeMap;

/// Planner knobs
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub topics_per_episode: usize,
    /// Move exercise/summary/knowledge-check units to the end of their group
    pub deprioritize_low_priority: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            topics_per_episode: 5,
            deprioritize_low_priority: true,
        }
    }
}

struct TopicGroup<'a> {
    origin_kind: OriginKind,
    title: &'a str,
    topics: Vec<&'a Topic>,
}

#[derive(Default)]
struct OpenUnit<'a> {
    origin_kind: Option<OriginKind>,
    titles: Vec<String>,
    topics: Vec<&'a Topic>,
}

pub struct EpisodePlanner {
    config: PlannerConfig,
}

impl EpisodePlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    fn limit(&self) -> usize {
        self.config.topics_per_episode.max(1)
    }

    /// Plan units for `topics`, numbering from `first_sequence`
    pub fn plan(
        &self,
        subject_id: &str,
        format: NarrationFormat,
        topics: &[Topic],
        first_sequence: u32,
    ) -> Vec<EpisodeUnit> {
        let limit = self.limit();
        let mut drafts: Vec<(String, Vec<&Topic>)> = Vec::new();
        let mut open = OpenUnit::default();

        for group in self.group(topics) {
            if group.topics.len() > limit {
                close(&mut open, &mut drafts);
                let parts = group.topics.chunks(limit);
                for (index, part) in parts.enumerate() {
                    drafts.push((
                        format!("{} (Part {})", group.title, index + 1),
                        part.to_vec(),
                    ));
                }
                continue;
            }

            let fits = open.topics.len() + group.topics.len() <= limit;
            let same_kind = open.origin_kind.map_or(true, |k| k == group.origin_kind);
            if !fits || !same_kind {
                close(&mut open, &mut drafts);
            }

            open.origin_kind = Some(group.origin_kind);
            if !open.titles.iter().any(|t| t == group.title) {
                open.titles.push(group.title.to_string());
            }
            open.topics.extend(group.topics);
        }
        close(&mut open, &mut drafts);

        let units: Vec<EpisodeUnit> = drafts
            .into_iter()
            .enumerate()
            .map(|(offset, (group_title, members))| EpisodeUnit {
                subject_id: subject_id.to_string(),
                format,
                sequence_number: first_sequence + offset as u32,
                group_title,
                topic_ids: members.iter().map(|t| t.id.clone()).collect(),
                topic_hashes: snapshot(&members),
                amendment_of: None,
                instruction: None,
            })
            .collect();

        tracing::debug!(
            subject_id,
            format = %format,
            topics = topics.len(),
            units = units.len(),
            first_sequence,
            "Planned episode units"
        );
        units
    }

    /// Split planable topics into contiguous groups by origin and parent
    fn group<'a>(&self, topics: &'a [Topic]) -> Vec<TopicGroup<'a>> {
        let mut groups: Vec<TopicGroup<'a>> = Vec::new();
        let mut current_key: Option<(OriginKind, &str)> = None;

        for topic in topics.iter().filter(|t| !t.is_gap()) {
            let key = (topic.origin_kind, topic.parent_key.as_str());
            if current_key == Some(key) {
                if let Some(group) = groups.last_mut() {
                    group.topics.push(topic);
                    continue;
                }
            }
            groups.push(TopicGroup {
                origin_kind: topic.origin_kind,
                title: &topic.parent_grouping,
                topics: vec![topic],
            });
            current_key = Some(key);
        }

        if self.config.deprioritize_low_priority {
            for group in &mut groups {
                // stable: keeps catalog order within each partition
                group.topics.sort_by_key(|t| t.low_priority);
            }
        }
        groups
    }
}

fn close<'a>(open: &mut OpenUnit<'a>, drafts: &mut Vec<(String, Vec<&'a Topic>)>) {
    if open.topics.is_empty() {
        return;
    }
    let unit = std::mem::take(open);
    drafts.push((unit.titles.join(" / "), unit.topics));
}

/// Topic digests of a unit's members at planning time
pub fn snapshot(topics: &[&Topic]) -> BTreeMap<String, String> {
    topics
        .iter()
        .filter_map(|t| t.content_hash.as_ref().map(|h| (t.id.clone(), h.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coverage, MatchSource};

    fn unit_topic(id: &str, module: &str) -> Topic {
        Topic {
            id: id.into(),
            title: format!("Unit {}", id),
            origin_kind: OriginKind::PathModule,
            parent_grouping: module.into(),
            parent_key: module.to_lowercase(),
            domain: "Path".into(),
            reference_text: "text".into(),
            source_urls: vec![],
            content_hash: Some(format!("hash-{}", id)),
            low_priority: false,
            fetch_failed: false,
            outline_urls: vec![],
            coverage: None,
        }
    }

    fn skill_topic(id: &str, objective: &str, source: MatchSource) -> Topic {
        Topic {
            origin_kind: OriginKind::ExamSkill,
            coverage: Some(Coverage {
                source,
                matched: None,
            }),
            content_hash: (source != MatchSource::Gap).then(|| format!("hash-{}", id)),
            ..unit_topic(id, objective)
        }
    }

    fn planner(limit: usize) -> EpisodePlanner {
        EpisodePlanner::new(PlannerConfig {
            topics_per_episode: limit,
            deprioritize_low_priority: true,
        })
    }

    #[test]
    fn test_oversized_module_split_into_parts() {
        let topics: Vec<Topic> = (1..=12)
            .map(|i| unit_topic(&format!("u{}", i), "Configure storage"))
            .collect();

        let units = planner(5).plan("az-104", NarrationFormat::Instructional, &topics, 1);

        assert_eq!(units.len(), 3);
        let sizes: Vec<usize> = units.iter().map(|u| u.topic_ids.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(units[0].group_title, "Configure storage (Part 1)");
        assert_eq!(units[2].group_title, "Configure storage (Part 3)");
        let seqs: Vec<u32> = units.iter().map(|u| u.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(units[0].topic_ids[0], "u1");
        assert_eq!(units[2].topic_ids, vec!["u11", "u12"]);
    }

    #[test]
    fn test_small_modules_share_a_unit_without_splitting() {
        let mut topics = vec![
            unit_topic("a1", "Alpha"),
            unit_topic("a2", "Alpha"),
            unit_topic("b1", "Beta"),
            unit_topic("b2", "Beta"),
            unit_topic("c1", "Gamma"),
            unit_topic("c2", "Gamma"),
        ];
        topics.push(unit_topic("c3", "Gamma"));

        let units = planner(5).plan("s", NarrationFormat::Instructional, &topics, 1);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].group_title, "Alpha / Beta");
        assert_eq!(units[0].topic_ids, vec!["a1", "a2", "b1", "b2"]);
        assert_eq!(units[1].group_title, "Gamma");
        assert_eq!(units[1].topic_ids.len(), 3);
    }

    #[test]
    fn test_gaps_skipped_and_kinds_not_mixed() {
        let topics = vec![
            unit_topic("m1", "Module"),
            skill_topic("s1", "Objective", MatchSource::TitleMatch),
            skill_topic("s2", "Objective", MatchSource::Gap),
            skill_topic("s3", "Objective", MatchSource::DocumentationSearch),
        ];

        let units = planner(5).plan("s", NarrationFormat::PodcastSolo, &topics, 4);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].topic_ids, vec!["m1"]);
        assert_eq!(units[1].topic_ids, vec!["s1", "s3"]);
        assert_eq!(units[1].sequence_number, 5);
        assert!(units[1].topic_hashes.contains_key("s3"));
    }

    #[test]
    fn test_low_priority_moved_to_end_of_group() {
        let mut topics = vec![
            unit_topic("intro", "M"),
            unit_topic("exercise", "M"),
            unit_topic("body", "M"),
        ];
        topics[1].low_priority = true;

        let units = planner(5).plan("s", NarrationFormat::Instructional, &topics, 1);
        assert_eq!(units[0].topic_ids, vec!["intro", "body", "exercise"]);

        let keep_order = EpisodePlanner::new(PlannerConfig {
            topics_per_episode: 5,
            deprioritize_low_priority: false,
        });
        let units = keep_order.plan("s", NarrationFormat::Instructional, &topics, 1);
        assert_eq!(units[0].topic_ids, vec!["intro", "exercise", "body"]);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let topics: Vec<Topic> = (0..23)
            .map(|i| unit_topic(&format!("t{}", i), &format!("Module {}", i / 4)))
            .collect();
        let first = planner(5).plan("s", NarrationFormat::Instructional, &topics, 1);
        let second = planner(5).plan("s", NarrationFormat::Instructional, &topics, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_input_plans_nothing() {
        assert!(planner(5)
            .plan("s", NarrationFormat::Instructional, &[], 1)
            .is_empty());
    }
}
