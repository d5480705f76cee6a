//! Learning-path catalog and exam skill outline clients
//!
//! The path catalog is organized grouping (learning path) → module → unit.
//! The skill outline is organized domain → objective → skill.

use super::http::{base_url, build_client, get_json, rate_limiter, DirectRateLimiter};
use crate::error::ExternalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level grouping reference returned by the listing call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingRef {
    pub uid: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogGrouping {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub modules: Vec<CatalogModule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModule {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub units: Vec<CatalogUnit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogUnit {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Catalog classification (exercise, summary, knowledge-check, ...)
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDomain {
    pub name: String,
    #[serde(default)]
    pub weight: Option<String>,
    #[serde(default)]
    pub objectives: Vec<SkillObjective>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillObjective {
    pub name: String,
    #[serde(default)]
    pub skills: Vec<SkillEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Educational-path catalog
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_groupings(&self, subject_id: &str) -> Result<Vec<GroupingRef>, ExternalError>;

    async fn fetch_grouping(
        &self,
        subject_id: &str,
        grouping_uid: &str,
    ) -> Result<CatalogGrouping, ExternalError>;

    /// Reference text of one unit
    async fn fetch_unit_text(&self, unit: &CatalogUnit) -> Result<String, ExternalError>;
}

/// Exam skill outline
#[async_trait]
pub trait SkillOutlineSource: Send + Sync {
    async fn fetch_outline(&self, subject_id: &str) -> Result<Vec<SkillDomain>, ExternalError>;
}

#[derive(Deserialize)]
struct UnitContent {
    #[serde(default)]
    text: String,
}

/// REST catalog client
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: DirectRateLimiter,
}

impl HttpCatalogClient {
    pub fn new(
        base: &str,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(base),
            rate_limiter: rate_limiter(requests_per_second),
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogClient {
    async fn list_groupings(&self, subject_id: &str) -> Result<Vec<GroupingRef>, ExternalError> {
        let url = format!("{}/subjects/{}/groupings", self.base_url, subject_id);
        get_json(&self.client, &self.rate_limiter, &url, &[]).await
    }

    async fn fetch_grouping(
        &self,
        subject_id: &str,
        grouping_uid: &str,
    ) -> Result<CatalogGrouping, ExternalError> {
        let url = format!(
            "{}/subjects/{}/groupings/{}",
            self.base_url, subject_id, grouping_uid
        );
        get_json(&self.client, &self.rate_limiter, &url, &[]).await
    }

    async fn fetch_unit_text(&self, unit: &CatalogUnit) -> Result<String, ExternalError> {
        let url = format!("{}/units/{}/content", self.base_url, unit.uid);
        let content: UnitContent = get_json(&self.client, &self.rate_limiter, &url, &[]).await?;
        Ok(content.text)
    }
}

/// REST skill outline client
pub struct HttpSkillOutlineClient {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: DirectRateLimiter,
}

impl HttpSkillOutlineClient {
    pub fn new(
        base: &str,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(base),
            rate_limiter: rate_limiter(requests_per_second),
        })
    }
}

#[async_trait]
impl SkillOutlineSource for HttpSkillOutlineClient {
    async fn fetch_outline(&self, subject_id: &str) -> Result<Vec<SkillDomain>, ExternalError> {
        let url = format!("{}/subjects/{}/skills", self.base_url, subject_id);
        get_json(&self.client, &self.rate_limiter, &url, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_parses_with_defaults() {
        let grouping: CatalogGrouping = serde_json::from_str(
            r#"{
                "uid": "lp-1",
                "title": "Administer identity",
                "modules": [
                    {"uid": "m-1", "title": "Configure users",
                     "units": [{"uid": "u-1", "title": "Introduction"},
                               {"uid": "u-2", "title": "Knowledge check", "kind": "knowledge-check"}]}
                ]
            }"#,
        )
        .unwrap();

        let module = &grouping.modules[0];
        assert_eq!(module.summary, "");
        assert_eq!(module.units.len(), 2);
        assert_eq!(module.units[1].kind.as_deref(), Some("knowledge-check"));
    }

    #[test]
    fn test_outline_parses() {
        let outline: Vec<SkillDomain> = serde_json::from_str(
            r#"[{"name": "Manage identities", "weight": "20-25%",
                 "objectives": [{"name": "Manage users",
                                 "skills": [{"title": "Create users", "urls": ["https://learn/x"]}]}]}]"#,
        )
        .unwrap();
        assert_eq!(outline[0].objectives[0].skills[0].urls, vec!["https://learn/x"]);
    }
}
