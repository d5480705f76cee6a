//! Data models for certaudio-gen

pub mod discovery;
pub mod episode;
pub mod topic;

pub use discovery::{
    ConfidenceReport, ContentDelta, CoverageBreakdown, DiscoveryMode, DiscoveryResult, Grade,
    ObjectiveScore, TopicChange,
};
pub use episode::{
    episode_id, ArtifactPaths, EpisodeRecord, EpisodeRef, EpisodeUnit, NarrationFormat,
    RunStatus, RunSummary, StateTransition, UnitOutcome, UnitProgress, UnitReport, UnitState,
};
pub use topic::{Coverage, MatchSource, OriginKind, Topic};
