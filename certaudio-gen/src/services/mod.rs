//! Service modules for the certaudio pipeline
//!
//! Discovery: catalog clients, topic merger, coverage reconciler, content hasher.
//! Planning: episode planner, amendment engine.
//! Generation: batch orchestrator and the narration/markup/speech/storage collaborators.

pub mod amendment_engine;
pub mod batch_orchestrator;
pub mod catalog_client;
pub mod content_hasher;
pub mod coverage_reconciler;
pub mod discovery;
pub mod doc_search_client;
pub mod episode_planner;
pub mod http;
pub mod index_publisher;
pub mod markup_converter;
pub mod narration_client;
pub mod object_store;
pub mod speech_client;
pub mod topic_merger;

pub use amendment_engine::{extend_ledger, AmendmentEngine, LedgerRevision};
pub use batch_orchestrator::{BatchOrchestrator, Collaborators, OrchestratorConfig};
pub use catalog_client::{
    CatalogSource, HttpCatalogClient, HttpSkillOutlineClient, SkillOutlineSource,
};
pub use content_hasher::ContentHasher;
pub use coverage_reconciler::{CoverageConfig, CoverageReconciler};
pub use discovery::{DiscoveryConfig, DiscoveryService, DiscoverySources};
pub use doc_search_client::{DocumentationSearch, HttpDocumentationSearch, SearchHit};
pub use episode_planner::{EpisodePlanner, PlannerConfig};
pub use index_publisher::{build_index, publish, EpisodeIndex, IndexError};
pub use markup_converter::{MarkupConverter, SsmlConverter, VoiceSettings};
pub use narration_client::{HttpNarrationClient, NarrationGenerator, NarrationRequest, NarrationStyle};
pub use object_store::{LocalObjectStore, ObjectStore};
pub use speech_client::{HttpSpeechClient, SpeechSynthesizer};
