//! Topic: smallest addressable unit of subject matter

use serde::{Deserialize, Serialize};

/// Which catalog a topic came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginKind {
    /// Unit of a learning-path module (authoritative content)
    PathModule,
    /// Skill from the exam skill outline
    ExamSkill,
}

/// Which step of the coverage fallback chain resolved an exam skill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSource {
    TitleMatch,
    DescriptionMatch,
    DocumentationSearch,
    Gap,
}

impl MatchSource {
    /// Coverage weight contributed to the confidence score
    pub fn weight(&self) -> f64 {
        match self {
            MatchSource::TitleMatch => 1.0,
            MatchSource::DescriptionMatch => 0.8,
            MatchSource::DocumentationSearch => 0.5,
            MatchSource::Gap => 0.0,
        }
    }
}

/// Coverage annotation attached to exam-skill topics by reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub source: MatchSource,
    /// Title of the module, unit or search hit that supplied the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
}

impl Coverage {
    pub fn gap() -> Self {
        Self {
            source: MatchSource::Gap,
            matched: None,
        }
    }
}

/// One addressable unit of subject matter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Stable key (catalog unit UID or `skill:` path)
    pub id: String,
    pub title: String,
    pub origin_kind: OriginKind,
    /// Module title (path modules) or `domain: objective` (exam skills)
    pub parent_grouping: String,
    /// Stable key of the parent grouping; consecutive topics sharing it form one planning group
    pub parent_key: String,
    /// Top-level grouping (learning path title or exam domain)
    pub domain: String,
    #[serde(default)]
    pub reference_text: String,
    /// Ordered set of source URLs
    #[serde(default)]
    pub source_urls: Vec<String>,
    /// Digest of `reference_text`, None when no content was found
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Exercise, summary or knowledge-check unit
    #[serde(default)]
    pub low_priority: bool,
    /// Reference text could not be fetched this run
    #[serde(default)]
    pub fetch_failed: bool,
    /// Links listed in the skill outline itself (exam skills only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outline_urls: Vec<String>,
    /// Set on exam-skill topics by coverage reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<Coverage>,
}

impl Topic {
    /// Append a URL unless already present, keeping insertion order
    pub fn add_source_url(&mut self, url: &str) {
        let url = url.trim();
        if !url.is_empty() && !self.source_urls.iter().any(|u| u == url) {
            self.source_urls.push(url.to_string());
        }
    }

    /// Exam-skill topic with no resolvable content after reconciliation
    pub fn is_gap(&self) -> bool {
        self.origin_kind == OriginKind::ExamSkill
            && matches!(
                self.coverage,
                Some(Coverage {
                    source: MatchSource::Gap,
                    ..
                })
            )
    }

    pub fn coverage_weight(&self) -> Option<f64> {
        self.coverage.as_ref().map(|c| c.source.weight())
    }
}
