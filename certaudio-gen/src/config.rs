//! Configuration resolution for certaudio-gen
//!
//! [`PipelineConfig`] is built once from TOML + environment + defaults and
//! then adjusted by command-line arguments. Components receive the parts
//! they need as explicit config objects.
//!
//! API keys resolve Database → ENV → TOML.

use crate::services::coverage_reconciler::CoverageConfig;
use crate::services::discovery::DiscoveryConfig;
use crate::services::episode_planner::PlannerConfig;
use crate::services::markup_converter::{VoiceSettings, DEFAULT_MAX_SEGMENT_CHARS};
use crate::services::narration_client::NarrationStyle;
use crate::services::speech_client::DEFAULT_OUTPUT_FORMAT;
use crate::services::OrchestratorConfig;
use crate::utils::RetryPolicy;
use certaudio_common::config::TomlConfig;
use certaudio_common::Result;
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::{info, warn};

pub const NARRATION_API_KEY_ENV: &str = "CERTAUDIO_NARRATION_API_KEY";
pub const SPEECH_API_KEY_ENV: &str = "CERTAUDIO_SPEECH_API_KEY";

/// Collaborator endpoints after resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub catalog_url: String,
    pub skills_url: String,
    pub search_url: String,
    pub narration_url: String,
    pub narration_model: String,
    pub speech_url: String,
    pub objects_base_url: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            catalog_url: "http://127.0.0.1:7801".to_string(),
            skills_url: "http://127.0.0.1:7801".to_string(),
            search_url: "http://127.0.0.1:7802".to_string(),
            narration_url: "http://127.0.0.1:7803/v1".to_string(),
            narration_model: "gpt-4o".to_string(),
            speech_url: "http://127.0.0.1:7804/cognitiveservices/v1".to_string(),
            objects_base_url: None,
        }
    }
}

/// Every pipeline knob in one place
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    pub topics_per_episode: usize,
    pub deprioritize_low_priority: bool,
    pub retry: RetryPolicy,
    /// Per-client request quota
    pub requests_per_second: u32,
    pub fetch_concurrency: usize,
    pub coverage: CoverageConfig,
    pub voices: VoiceSettings,
    pub output_format: String,
    pub max_segment_chars: usize,
    pub narration_style: NarrationStyle,
    pub endpoints: Endpoints,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_workers: 4,
            topics_per_episode: 5,
            deprioritize_low_priority: true,
            retry: RetryPolicy::default(),
            requests_per_second: 5,
            fetch_concurrency: 4,
            coverage: CoverageConfig::default(),
            voices: VoiceSettings::default(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            max_segment_chars: DEFAULT_MAX_SEGMENT_CHARS,
            narration_style: NarrationStyle::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the TOML `[pipeline]`/`[services]` tables,
    /// then with `CERTAUDIO_*_URL` environment variables for endpoints
    pub fn from_toml(toml: &TomlConfig) -> Self {
        let mut config = Self::default();
        let p = &toml.pipeline;

        if let Some(v) = p.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = p.max_workers {
            config.max_workers = v;
        }
        if let Some(v) = p.topics_per_episode {
            config.topics_per_episode = v;
        }
        if let Some(v) = p.deprioritize_low_priority {
            config.deprioritize_low_priority = v;
        }
        if let Some(v) = p.max_attempts {
            config.retry.max_attempts = v;
        }
        if let Some(v) = p.initial_backoff_ms {
            config.retry.initial_backoff = Duration::from_millis(v);
        }
        if let Some(v) = p.max_backoff_ms {
            config.retry.max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = p.backoff_multiplier {
            config.retry.multiplier = v;
        }
        if let Some(v) = p.call_timeout_secs {
            config.retry.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = p.requests_per_second {
            config.requests_per_second = v;
        }
        if let Some(v) = p.fetch_concurrency {
            config.fetch_concurrency = v;
        }
        if let Some(v) = p.title_match_threshold {
            config.coverage.title_match_threshold = v;
        }
        if let Some(v) = p.description_match_threshold {
            config.coverage.description_match_threshold = v;
        }
        if let Some(v) = p.search_top {
            config.coverage.search_top = v;
        }
        if let Some(v) = &p.instructional_voice {
            config.voices.instructional = v.clone();
        }
        if let Some(v) = &p.podcast_host_voice {
            config.voices.podcast_host = v.clone();
        }
        if let Some(v) = &p.podcast_expert_voice {
            config.voices.podcast_expert = v.clone();
        }
        if let Some(v) = &p.output_format {
            config.output_format = v.clone();
        }
        if let Some(v) = p.max_segment_chars {
            config.max_segment_chars = v;
        }

        let s = &toml.services;
        let e = &mut config.endpoints;
        resolve_endpoint(&mut e.catalog_url, "CERTAUDIO_CATALOG_URL", &s.catalog_url);
        resolve_endpoint(&mut e.skills_url, "CERTAUDIO_SKILLS_URL", &s.skills_url);
        resolve_endpoint(&mut e.search_url, "CERTAUDIO_SEARCH_URL", &s.search_url);
        resolve_endpoint(&mut e.narration_url, "CERTAUDIO_NARRATION_URL", &s.narration_url);
        resolve_endpoint(&mut e.narration_model, "CERTAUDIO_NARRATION_MODEL", &s.narration_model);
        resolve_endpoint(&mut e.speech_url, "CERTAUDIO_SPEECH_URL", &s.speech_url);
        e.objects_base_url = std::env::var("CERTAUDIO_OBJECTS_BASE_URL")
            .ok()
            .filter(|v| is_valid_key(v))
            .or_else(|| s.objects_base_url.clone());

        config
    }

    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            topics_per_episode: self.topics_per_episode,
            deprioritize_low_priority: self.deprioritize_low_priority,
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            retry: self.retry.clone(),
            coverage: self.coverage.clone(),
            fetch_concurrency: self.fetch_concurrency,
        }
    }

    pub fn orchestrator(&self, force_regenerate: bool) -> OrchestratorConfig {
        OrchestratorConfig {
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            force_regenerate,
            retry: self.retry.clone(),
            voices: self.voices.clone(),
            output_format: self.output_format.clone(),
            narration_style: self.narration_style.clone(),
        }
    }
}

/// ENV beats TOML beats the current (default) value
fn resolve_endpoint(target: &mut String, env_var: &str, toml_value: &Option<String>) {
    if let Ok(value) = std::env::var(env_var) {
        if is_valid_key(&value) {
            *target = value;
            return;
        }
    }
    if let Some(value) = toml_value {
        if is_valid_key(value) {
            *target = value.clone();
        }
    }
}

/// Resolve the narration service API key
pub async fn resolve_narration_api_key(
    db: &Pool<Sqlite>,
    toml_config: &TomlConfig,
) -> Result<Option<String>> {
    let db_key = crate::db::settings::get_narration_api_key(db).await?;
    Ok(resolve_api_key(
        "Narration",
        db_key,
        std::env::var(NARRATION_API_KEY_ENV).ok(),
        toml_config.narration_api_key.clone(),
    ))
}

/// Resolve the speech service API key
pub async fn resolve_speech_api_key(
    db: &Pool<Sqlite>,
    toml_config: &TomlConfig,
) -> Result<Option<String>> {
    let db_key = crate::db::settings::get_speech_api_key(db).await?;
    Ok(resolve_api_key(
        "Speech",
        db_key,
        std::env::var(SPEECH_API_KEY_ENV).ok(),
        toml_config.speech_api_key.clone(),
    ))
}

/// **Priority:** Database → ENV → TOML
///
/// A missing key is not an error: local collaborators may not need one.
fn resolve_api_key(
    service: &str,
    db_key: Option<String>,
    env_key: Option<String>,
    toml_key: Option<String>,
) -> Option<String> {
    let candidates = [
        ("database", db_key),
        ("environment", env_key),
        ("TOML", toml_key),
    ];
    let valid: Vec<(&str, String)> = candidates
        .into_iter()
        .filter_map(|(source, key)| key.filter(|k| is_valid_key(k)).map(|k| (source, k)))
        .collect();

    if valid.len() > 1 {
        let sources: Vec<&str> = valid.iter().map(|(s, _)| *s).collect();
        warn!(
            "{} API key found in multiple sources: {}. Using {} (highest priority).",
            service,
            sources.join(", "),
            sources[0]
        );
    }

    match valid.into_iter().next() {
        Some((source, key)) => {
            info!("{} API key loaded from {}", service, source);
            Some(key)
        }
        None => {
            warn!("{} API key not configured; requests are sent without one", service);
            None
        }
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use certaudio_common::config::PipelineOverrides;
    use serial_test::serial;

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("abc"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("   "));
    }

    #[tokio::test]
    #[serial]
    async fn test_database_key_wins() {
        let db = open_in_memory().await.unwrap();
        crate::db::settings::set_narration_api_key(&db, "db-key".into())
            .await
            .unwrap();
        std::env::set_var(NARRATION_API_KEY_ENV, "env-key");
        let toml = TomlConfig {
            narration_api_key: Some("toml-key".into()),
            ..Default::default()
        };

        let key = resolve_narration_api_key(&db, &toml).await.unwrap();
        std::env::remove_var(NARRATION_API_KEY_ENV);

        assert_eq!(key.as_deref(), Some("db-key"));
    }

    #[tokio::test]
    #[serial]
    async fn test_env_then_toml_then_none() {
        let db = open_in_memory().await.unwrap();
        let toml = TomlConfig {
            speech_api_key: Some("toml-key".into()),
            ..Default::default()
        };

        std::env::set_var(SPEECH_API_KEY_ENV, "env-key");
        let key = resolve_speech_api_key(&db, &toml).await.unwrap();
        std::env::remove_var(SPEECH_API_KEY_ENV);
        assert_eq!(key.as_deref(), Some("env-key"));

        let key = resolve_speech_api_key(&db, &toml).await.unwrap();
        assert_eq!(key.as_deref(), Some("toml-key"));

        let key = resolve_speech_api_key(&db, &TomlConfig::default()).await.unwrap();
        assert_eq!(key, None);
    }

    #[test]
    fn test_whitespace_key_ignored() {
        let key = resolve_api_key("Narration", Some("  ".into()), None, Some("t".into()));
        assert_eq!(key.as_deref(), Some("t"));
    }

    #[test]
    #[serial]
    fn test_pipeline_config_from_toml() {
        std::env::remove_var("CERTAUDIO_CATALOG_URL");
        let toml = TomlConfig {
            pipeline: PipelineOverrides {
                batch_size: Some(3),
                topics_per_episode: Some(8),
                max_attempts: Some(2),
                podcast_expert_voice: Some("en-GB-RyanNeural".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = PipelineConfig::from_toml(&toml);

        assert_eq!(config.batch_size, 3);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.planner().topics_per_episode, 8);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.voices.podcast_expert, "en-GB-RyanNeural");
        assert!(config.orchestrator(true).force_regenerate);
        assert_eq!(config.endpoints.catalog_url, Endpoints::default().catalog_url);
    }

    #[test]
    #[serial]
    fn test_endpoint_env_beats_toml() {
        std::env::set_var("CERTAUDIO_SEARCH_URL", "http://env-search");
        let mut toml = TomlConfig::default();
        toml.services.search_url = Some("http://toml-search".into());

        let config = PipelineConfig::from_toml(&toml);
        std::env::remove_var("CERTAUDIO_SEARCH_URL");

        assert_eq!(config.endpoints.search_url, "http://env-search");
    }
}
