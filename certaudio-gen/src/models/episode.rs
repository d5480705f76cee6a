//! Episode units, episode records and the per-unit generation state machine
//!
//! Unit lifecycle:
//! PLANNED → GENERATING → AUDIO_SYNTHESIZING → UPLOADING → PERSISTED,
//! with FAILED reachable from every non-terminal state and
//! PLANNED → PERSISTED when a record already exists (skip).

use crate::error::UnitFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Narration style of an episode series
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum NarrationFormat {
    #[default]
    Instructional,
    PodcastSolo,
    PodcastDuo,
}

impl NarrationFormat {
    pub const ALL: [NarrationFormat; 3] = [
        NarrationFormat::Instructional,
        NarrationFormat::PodcastSolo,
        NarrationFormat::PodcastDuo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NarrationFormat::Instructional => "instructional",
            NarrationFormat::PodcastSolo => "podcast-solo",
            NarrationFormat::PodcastDuo => "podcast-duo",
        }
    }
}

impl fmt::Display for NarrationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NarrationFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NarrationFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown narration format '{}'", s))
    }
}

/// Pointer to an episode from a Source record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub format: NarrationFormat,
    pub sequence_number: u32,
}

/// Episode id: `{subject}-{format}-{NNN}`
pub fn episode_id(subject_id: &str, format: NarrationFormat, sequence_number: u32) -> String {
    format!("{}-{}-{:03}", subject_id, format, sequence_number)
}

/// Object paths of the three artifacts of one episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub audio: String,
    pub script: String,
    pub markup: String,
}

impl ArtifactPaths {
    pub fn new(subject_id: &str, format: NarrationFormat, sequence_number: u32) -> Self {
        let series = format!("{}-{}", subject_id, format);
        Self {
            audio: format!("{}/episodes/{:03}.mp3", series, sequence_number),
            script: format!("{}-scripts/scripts/{:03}.md", series, sequence_number),
            markup: format!("{}-scripts/ssml/{:03}.ssml", series, sequence_number),
        }
    }
}

/// Planned group of topics destined for one audio episode
///
/// Fixed once its Episode Record exists; until then a planning pass may
/// narrow or renumber it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeUnit {
    pub subject_id: String,
    pub format: NarrationFormat,
    pub sequence_number: u32,
    pub group_title: String,
    pub topic_ids: Vec<String>,
    /// Topic digests at planning time
    pub topic_hashes: BTreeMap<String, String>,
    pub amendment_of: Option<u32>,
    /// Synthetic framing passed to narration for amendments
    pub instruction: Option<String>,
}

impl EpisodeUnit {
    pub fn episode_id(&self) -> String {
        episode_id(&self.subject_id, self.format, self.sequence_number)
    }

    /// Display title; amendments are prefixed with `Update: `
    pub fn title(&self) -> String {
        if self.amendment_of.is_some() {
            format!("Update: {}", self.group_title)
        } else {
            self.group_title.clone()
        }
    }
}

/// Materialized result of generating one episode unit; written once per sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: String,
    pub subject_id: String,
    pub format: NarrationFormat,
    pub sequence_number: u32,
    pub title: String,
    pub group_title: String,
    pub topic_ids: Vec<String>,
    /// Per-topic digests at generation time
    pub topic_hashes: BTreeMap<String, String>,
    /// Digest over `topic_hashes`
    pub content_hash: String,
    pub audio_url: String,
    pub script_url: String,
    pub markup_url: String,
    pub duration_seconds: f64,
    pub word_count: usize,
    pub amendment_of: Option<u32>,
    pub source_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Generation state of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Planned,
    Generating,
    AudioSynthesizing,
    Uploading,
    Persisted,
    Failed { reason: UnitFailure },
}

impl UnitState {
    pub fn name(&self) -> &'static str {
        match self {
            UnitState::Planned => "PLANNED",
            UnitState::Generating => "GENERATING",
            UnitState::AudioSynthesizing => "AUDIO_SYNTHESIZING",
            UnitState::Uploading => "UPLOADING",
            UnitState::Persisted => "PERSISTED",
            UnitState::Failed { .. } => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Persisted | UnitState::Failed { .. })
    }

    fn allows(&self, next: &UnitState) -> bool {
        use UnitState::*;
        match (self, next) {
            (from, Failed { .. }) => !from.is_terminal(),
            (Planned, Generating) | (Planned, Persisted) => true,
            (Generating, AudioSynthesizing) => true,
            (AudioSynthesizing, Uploading) => true,
            (Uploading, Persisted) => true,
            _ => false,
        }
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub sequence_number: u32,
    pub old_state: &'static str,
    pub new_state: &'static str,
    pub transitioned_at: DateTime<Utc>,
}

/// In-memory progress of one unit through a run
#[derive(Debug, Clone)]
pub struct UnitProgress {
    pub sequence_number: u32,
    pub state: UnitState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl UnitProgress {
    pub fn new(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            state: UnitState::Planned,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to a new state
    ///
    /// Returns `None` and leaves the state untouched when the transition is not allowed.
    pub fn transition_to(&mut self, new_state: UnitState) -> Option<StateTransition> {
        if !self.state.allows(&new_state) {
            tracing::warn!(
                sequence_number = self.sequence_number,
                from = self.state.name(),
                to = new_state.name(),
                "Rejected unit state transition"
            );
            return None;
        }

        let transition = StateTransition {
            sequence_number: self.sequence_number,
            old_state: self.state.name(),
            new_state: new_state.name(),
            transitioned_at: Utc::now(),
        };
        if new_state.is_terminal() {
            self.ended_at = Some(transition.transitioned_at);
        }
        self.state = new_state;
        Some(transition)
    }
}

/// Final outcome of one unit in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum UnitOutcome {
    /// Work performed and record written
    Persisted { episode_id: String },
    /// A record already existed
    Skipped { episode_id: String },
    Failed { reason: UnitFailure },
    /// Abandoned because the run was cancelled
    Cancelled,
}

/// Outcome line in a run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub sequence_number: u32,
    pub group_title: String,
    pub outcome: UnitOutcome,
}

/// Overall classification of a generation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    /// Some units failed or were cancelled; warning only
    PartialFailure,
    /// Every attempted unit failed
    Fatal,
    /// Nothing was attempted (everything skipped or nothing planned)
    AllSkipped,
}

impl RunStatus {
    /// Process exit code of `generate`
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Fatal => 1,
            RunStatus::PartialFailure => 2,
            RunStatus::AllSkipped => 3,
        }
    }
}

/// Per-unit outcomes of a generation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub subject_id: String,
    pub format: NarrationFormat,
    pub reports: Vec<UnitReport>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn persisted(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Persisted { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Cancelled))
    }

    pub fn failures(&self) -> impl Iterator<Item = (u32, &UnitFailure)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            UnitOutcome::Failed { reason } => Some((r.sequence_number, reason)),
            _ => None,
        })
    }

    pub fn status(&self) -> RunStatus {
        let failed = self.failed();
        let attempted = self.persisted() + failed;

        if failed > 0 && failed == attempted {
            RunStatus::Fatal
        } else if failed > 0 || self.cancelled() > 0 {
            RunStatus::PartialFailure
        } else if attempted == 0 {
            RunStatus::AllSkipped
        } else {
            RunStatus::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(outcomes: Vec<UnitOutcome>) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            subject_id: "az-104".into(),
            format: NarrationFormat::Instructional,
            reports: outcomes
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| UnitReport {
                    sequence_number: i as u32 + 1,
                    group_title: "Group".into(),
                    outcome,
                })
                .collect(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    fn failed() -> UnitOutcome {
        UnitOutcome::Failed {
            reason: UnitFailure::InvalidMarkup {
                message: "x".into(),
            },
        }
    }

    fn persisted() -> UnitOutcome {
        UnitOutcome::Persisted {
            episode_id: "e".into(),
        }
    }

    fn skipped() -> UnitOutcome {
        UnitOutcome::Skipped {
            episode_id: "e".into(),
        }
    }

    #[test]
    fn test_ids_and_paths() {
        assert_eq!(
            episode_id("az-104", NarrationFormat::PodcastDuo, 7),
            "az-104-podcast-duo-007"
        );
        let paths = ArtifactPaths::new("az-104", NarrationFormat::Instructional, 12);
        assert_eq!(paths.audio, "az-104-instructional/episodes/012.mp3");
        assert_eq!(paths.script, "az-104-instructional-scripts/scripts/012.md");
        assert_eq!(paths.markup, "az-104-instructional-scripts/ssml/012.ssml");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(
            "podcast-solo".parse::<NarrationFormat>().unwrap(),
            NarrationFormat::PodcastSolo
        );
        assert!("radio".parse::<NarrationFormat>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut progress = UnitProgress::new(3);
        for state in [
            UnitState::Generating,
            UnitState::AudioSynthesizing,
            UnitState::Uploading,
            UnitState::Persisted,
        ] {
            assert!(progress.transition_to(state).is_some());
        }
        assert!(progress.ended_at.is_some());
    }

    #[test]
    fn test_skip_and_invalid_transitions() {
        let mut progress = UnitProgress::new(1);
        assert!(progress.transition_to(UnitState::Uploading).is_none());
        assert_eq!(progress.state, UnitState::Planned);
        assert!(progress.transition_to(UnitState::Persisted).is_some());

        let failure = UnitFailure::InvalidMarkup {
            message: "x".into(),
        };
        assert!(progress
            .transition_to(UnitState::Failed { reason: failure })
            .is_none());
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        for path in [
            vec![],
            vec![UnitState::Generating],
            vec![UnitState::Generating, UnitState::AudioSynthesizing],
        ] {
            let mut progress = UnitProgress::new(1);
            for s in path {
                progress.transition_to(s);
            }
            assert!(progress
                .transition_to(UnitState::Failed {
                    reason: UnitFailure::MissingTopic {
                        topic_id: "t".into()
                    }
                })
                .is_some());
        }
    }

    #[test]
    fn test_amendment_title() {
        let unit = EpisodeUnit {
            subject_id: "az-104".into(),
            format: NarrationFormat::Instructional,
            sequence_number: 9,
            group_title: "Configure storage".into(),
            topic_ids: vec!["u1".into()],
            topic_hashes: BTreeMap::new(),
            amendment_of: Some(2),
            instruction: None,
        };
        assert_eq!(unit.title(), "Update: Configure storage");
        assert_eq!(unit.episode_id(), "az-104-instructional-009");
    }

    #[test]
    fn test_run_status() {
        assert_eq!(summary(vec![]).status(), RunStatus::AllSkipped);
        assert_eq!(summary(vec![skipped(), skipped()]).status(), RunStatus::AllSkipped);
        assert_eq!(summary(vec![skipped(), persisted()]).status(), RunStatus::Success);
        assert_eq!(
            summary(vec![persisted(), failed()]).status(),
            RunStatus::PartialFailure
        );
        assert_eq!(summary(vec![skipped(), failed()]).status(), RunStatus::Fatal);
        assert_eq!(
            summary(vec![persisted(), UnitOutcome::Cancelled]).status(),
            RunStatus::PartialFailure
        );
        assert_eq!(RunStatus::Fatal.exit_code(), 1);
        assert_eq!(RunStatus::PartialFailure.exit_code(), 2);
    }
}
