//! Subject discovery result, confidence report and content delta

use super::{EpisodeRef, Topic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Which catalogs a discovery run reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Exam skill outline only
    Quick,
    /// Learning-path catalog only
    Deep,
    /// Both catalogs plus coverage reconciliation
    #[default]
    Comprehensive,
}

impl DiscoveryMode {
    pub fn includes_paths(&self) -> bool {
        matches!(self, DiscoveryMode::Deep | DiscoveryMode::Comprehensive)
    }

    pub fn includes_skills(&self) -> bool {
        matches!(self, DiscoveryMode::Quick | DiscoveryMode::Comprehensive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMode::Quick => "quick",
            DiscoveryMode::Deep => "deep",
            DiscoveryMode::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Ok(DiscoveryMode::Quick),
            "deep" => Ok(DiscoveryMode::Deep),
            "comprehensive" => Ok(DiscoveryMode::Comprehensive),
            other => Err(format!("unknown discovery mode '{}'", other)),
        }
    }
}

/// Ordinal grade derived from the confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.90 {
            Grade::A
        } else if score >= 0.75 {
            Grade::B
        } else if score >= 0.60 {
            Grade::C
        } else if score >= 0.40 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

/// Exam-skill topic counts per fallback step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageBreakdown {
    pub title_match: usize,
    pub description_match: usize,
    pub documentation_search: usize,
    pub gap: usize,
}

/// Confidence for one exam objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveScore {
    pub objective: String,
    pub score: f64,
    pub topic_count: usize,
    pub gap_count: usize,
}

/// Coverage quality of one discovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    /// Weighted coverage over exam-skill topics, 0.0 to 1.0
    pub score: f64,
    pub grade: Grade,
    pub exam_skill_topics: usize,
    pub module_topics: usize,
    pub breakdown: CoverageBreakdown,
    pub per_objective: Vec<ObjectiveScore>,
    /// URLs contributed by description matches and documentation search
    pub supplemental_urls: Vec<String>,
}

/// Digest change for one topic since the previous run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicChange {
    pub topic_id: String,
    pub old_hash: Option<String>,
    pub new_hash: String,
    /// Episodes that already cover this topic
    pub affected_episodes: Vec<EpisodeRef>,
}

/// Comparison of this run's digests against stored Source records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentDelta {
    pub changed: Vec<TopicChange>,
    pub unchanged_count: usize,
    /// Topics whose content could not be fetched; stored digest retained
    pub fetch_error_count: usize,
    /// Topics with content and no Source record yet
    pub new_topics: Vec<String>,
    /// Source records whose topic is absent from this graph (reported only)
    pub orphaned_topics: Vec<String>,
}

/// Full merged topic graph for one subject at one point in time
///
/// Created fresh by each discovery run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub run_id: Uuid,
    pub subject_id: String,
    pub mode: DiscoveryMode,
    pub topics: Vec<Topic>,
    pub confidence: ConfidenceReport,
    /// Ids of exam-skill topics with no resolvable content
    pub gaps: Vec<String>,
    pub delta: ContentDelta,
    pub created_at: DateTime<Utc>,
}

impl DiscoveryResult {
    pub fn confidence_score(&self) -> f64 {
        self.confidence.score
    }

    pub fn topic(&self, id: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }
}
