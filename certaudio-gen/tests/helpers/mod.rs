//! Shared fakes for integration tests
//!
//! In-process collaborators implementing the service traits, plus builders
//! for a discovery service and an orchestrator over an in-memory database.

#![allow(dead_code)]

use async_trait::async_trait;
use certaudio_common::events::EventBus;
use certaudio_gen::error::ExternalError;
use certaudio_gen::models::NarrationFormat;
use certaudio_gen::services::catalog_client::{
    CatalogGrouping, CatalogModule, CatalogSource, CatalogUnit, GroupingRef, SkillDomain,
    SkillEntry, SkillObjective, SkillOutlineSource,
};
use certaudio_gen::services::{
    BatchOrchestrator, Collaborators, DiscoveryConfig, DiscoveryService, DiscoverySources,
    DocumentationSearch, LocalObjectStore, NarrationGenerator, NarrationRequest, ObjectStore,
    OrchestratorConfig, SearchHit, SpeechSynthesizer, SsmlConverter, VoiceSettings,
};
use certaudio_gen::utils::RetryPolicy;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const SUBJECT: &str = "az-104";

/// Module with `unit_count` units titled `{title} unit N`
pub fn module(uid: &str, title: &str, unit_count: usize) -> CatalogModule {
    CatalogModule {
        uid: uid.to_string(),
        title: title.to_string(),
        summary: format!("Learn about {}", title.to_lowercase()),
        url: format!("https://learn.example/{}", uid),
        units: (1..=unit_count)
            .map(|n| CatalogUnit {
                uid: format!("{}-u{}", uid, n),
                title: format!("{} unit {}", title, n),
                url: format!("https://learn.example/{}/{}", uid, n),
                kind: None,
            })
            .collect(),
    }
}

/// Catalog with one grouping; unit texts can be edited between runs
pub struct FakeCatalog {
    pub modules: Vec<CatalogModule>,
    pub texts: Mutex<HashMap<String, String>>,
    /// Units whose text fetch fails transiently
    pub unavailable: Mutex<HashSet<String>>,
}

impl FakeCatalog {
    pub fn new(modules: Vec<CatalogModule>) -> Self {
        Self {
            modules,
            texts: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_unavailable(&self, unit_uids: &[&str]) {
        *self.unavailable.lock().unwrap() = unit_uids.iter().map(|u| u.to_string()).collect();
    }

    pub fn set_text(&self, unit_uid: &str, text: &str) {
        self.texts
            .lock()
            .unwrap()
            .insert(unit_uid.to_string(), text.to_string());
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn list_groupings(&self, _subject_id: &str) -> Result<Vec<GroupingRef>, ExternalError> {
        Ok(vec![GroupingRef {
            uid: "path-admin".into(),
            title: "Administrator path".into(),
        }])
    }

    async fn fetch_grouping(
        &self,
        _subject_id: &str,
        grouping_uid: &str,
    ) -> Result<CatalogGrouping, ExternalError> {
        Ok(CatalogGrouping {
            uid: grouping_uid.to_string(),
            title: "Administrator path".into(),
            modules: self.modules.clone(),
        })
    }

    async fn fetch_unit_text(&self, unit: &CatalogUnit) -> Result<String, ExternalError> {
        if self.unavailable.lock().unwrap().contains(&unit.uid) {
            return Err(ExternalError::ServiceUnavailable(format!("{} unavailable", unit.uid)));
        }
        Ok(self
            .texts
            .lock()
            .unwrap()
            .get(&unit.uid)
            .cloned()
            .unwrap_or_else(|| format!("Reference material for {}.", unit.title)))
    }
}

/// Skill outline with a single domain and objective
pub struct FakeOutline {
    pub skills: Vec<String>,
}

#[async_trait]
impl SkillOutlineSource for FakeOutline {
    async fn fetch_outline(&self, _subject_id: &str) -> Result<Vec<SkillDomain>, ExternalError> {
        Ok(vec![SkillDomain {
            name: "Manage resources".into(),
            weight: Some("20-25%".into()),
            objectives: vec![SkillObjective {
                name: "Operate the platform".into(),
                skills: self
                    .skills
                    .iter()
                    .map(|title| SkillEntry {
                        title: title.clone(),
                        description: String::new(),
                        urls: vec![],
                    })
                    .collect(),
            }],
        }])
    }
}

/// Documentation search answering only the listed queries
pub struct FakeSearch {
    pub answers: Mutex<HashSet<String>>,
}

impl FakeSearch {
    pub fn new(answers: Vec<&str>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(str::to_string).collect()),
        }
    }

    pub fn answer(&self, query: &str) {
        self.answers.lock().unwrap().insert(query.to_string());
    }
}

#[async_trait]
impl DocumentationSearch for FakeSearch {
    async fn search(&self, query: &str, _top: usize) -> Result<Vec<SearchHit>, ExternalError> {
        if !self.answers.lock().unwrap().contains(query) {
            return Ok(vec![]);
        }
        Ok(vec![SearchHit {
            title: format!("{} overview", query),
            url: format!("https://docs.example/{}", query.to_lowercase().replace(' ', "-")),
            snippet: format!("Documentation about {}.", query),
        }])
    }
}

/// Narration that echoes its request; titles containing a blocked word are refused
#[derive(Default)]
pub struct FakeNarration {
    pub calls: AtomicUsize,
    pub blocked: Mutex<Option<String>>,
    /// Titles containing this word always fail transiently
    pub unavailable: Mutex<Option<String>>,
    pub requests: Mutex<Vec<NarrationRequest>>,
    /// Cancelled after the first call when set
    pub cancel_after_first: Option<CancellationToken>,
}

impl FakeNarration {
    pub fn block(&self, word: Option<&str>) {
        *self.blocked.lock().unwrap() = word.map(str::to_string);
    }

    pub fn make_unavailable(&self, word: Option<&str>) {
        *self.unavailable.lock().unwrap() = word.map(str::to_string);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NarrationGenerator for FakeNarration {
    async fn generate(&self, request: &NarrationRequest) -> Result<String, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }

        let unavailable = self.unavailable.lock().unwrap().clone();
        if let Some(word) = unavailable {
            if request.episode_title.contains(&word) {
                return Err(ExternalError::ServiceUnavailable("narration overloaded".into()));
            }
        }

        let blocked = self.blocked.lock().unwrap().clone();
        if let Some(word) = blocked {
            if request.episode_title.contains(&word) {
                return Err(ExternalError::ContentPolicy(format!(
                    "refused episode {}",
                    request.sequence_number
                )));
            }
        }

        let topics: Vec<&str> = request.topics.iter().map(|t| t.title.as_str()).collect();
        Ok(format!(
            "Welcome to episode {}. Today we cover {}. [PAUSE] That is all.",
            request.sequence_number,
            topics.join(", ")
        ))
    }
}

/// Speech synthesis returning a fixed-size payload per segment
///
/// Tracks how many calls overlap; `delay` holds each call open.
#[derive(Default)]
pub struct FakeSpeech {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub delay: Duration,
}

impl FakeSpeech {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    async fn synthesize(
        &self,
        _markup: &str,
        _voice: &str,
        _output_format: &str,
    ) -> Result<Vec<u8>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![0xFF; 24_000])
    }
}

/// Local store whose uploads can be made to fail by path suffix
pub struct TestObjects {
    pub inner: LocalObjectStore,
    pub failing_suffix: Mutex<Option<String>>,
}

impl TestObjects {
    pub fn fail_uploads_ending(&self, suffix: Option<&str>) {
        *self.failing_suffix.lock().unwrap() = suffix.map(str::to_string);
    }
}

#[async_trait]
impl ObjectStore for TestObjects {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ExternalError> {
        let failing = self.failing_suffix.lock().unwrap().clone();
        if failing.is_some_and(|suffix| path.ends_with(&suffix)) {
            return Err(ExternalError::Permanent(format!("upload of {} rejected", path)));
        }
        self.inner.put(path, bytes, content_type).await
    }

    async fn delete(&self, prefix: &str) -> Result<(), ExternalError> {
        self.inner.delete(prefix).await
    }
}

pub async fn discovery_service(
    pool: &SqlitePool,
    catalog: Arc<FakeCatalog>,
    skills: Vec<&str>,
    search_answers: Vec<&str>,
) -> DiscoveryService {
    discovery_service_with_search(pool, catalog, skills, Arc::new(FakeSearch::new(search_answers)))
}

pub fn discovery_service_with_search(
    pool: &SqlitePool,
    catalog: Arc<FakeCatalog>,
    skills: Vec<&str>,
    search: Arc<FakeSearch>,
) -> DiscoveryService {
    let sources = DiscoverySources {
        catalog,
        skills: Arc::new(FakeOutline {
            skills: skills.into_iter().map(str::to_string).collect(),
        }),
        search,
    };
    let config = DiscoveryConfig {
        retry: RetryPolicy::immediate(2),
        ..Default::default()
    };
    DiscoveryService::new(pool.clone(), EventBus::new(64), sources, config)
}

pub struct Harness {
    pub orchestrator: BatchOrchestrator,
    pub narration: Arc<FakeNarration>,
    pub speech: Arc<FakeSpeech>,
    pub objects: Arc<TestObjects>,
    pub objects_dir: TempDir,
}

pub fn orchestrator(
    pool: &SqlitePool,
    narration: FakeNarration,
    batch_size: usize,
    force_regenerate: bool,
) -> Harness {
    let config = OrchestratorConfig {
        batch_size,
        max_workers: 3,
        force_regenerate,
        retry: RetryPolicy::immediate(3),
        voices: VoiceSettings::default(),
        ..Default::default()
    };
    orchestrator_with(pool, narration, FakeSpeech::default(), config)
}

pub fn orchestrator_with(
    pool: &SqlitePool,
    narration: FakeNarration,
    speech: FakeSpeech,
    config: OrchestratorConfig,
) -> Harness {
    let narration = Arc::new(narration);
    let speech = Arc::new(speech);
    let objects_dir = TempDir::new().unwrap();
    let objects = Arc::new(TestObjects {
        inner: LocalObjectStore::new(objects_dir.path().to_path_buf(), None),
        failing_suffix: Mutex::new(None),
    });

    let collaborators = Collaborators {
        narration: narration.clone(),
        markup: Arc::new(SsmlConverter::new(4500)),
        speech: speech.clone(),
        objects: objects.clone(),
    };

    Harness {
        orchestrator: BatchOrchestrator::new(pool.clone(), EventBus::new(256), collaborators, config),
        narration,
        speech,
        objects,
        objects_dir,
    }
}

pub const FORMAT: NarrationFormat = NarrationFormat::Instructional;

/// Persisted sequence numbers of the test series
pub async fn persisted_sequences(pool: &SqlitePool) -> Vec<u32> {
    certaudio_gen::db::episodes::load_records(pool, SUBJECT, FORMAT)
        .await
        .unwrap()
        .iter()
        .map(|r| r.sequence_number)
        .collect()
}
