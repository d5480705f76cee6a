//! Pipeline event types and broadcast bus
//!
//! Progress of discovery and generation runs is published on an [`EventBus`]
//! so that the HTTP layer can stream it to progress trackers over SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by discovery and generation runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A discovery run published a new result
    DiscoveryCompleted {
        run_id: Uuid,
        subject_id: String,
        topic_count: usize,
        gap_count: usize,
        confidence_score: f64,
        grade: String,
        timestamp: DateTime<Utc>,
    },

    /// A generation run started
    GenerationStarted {
        run_id: Uuid,
        subject_id: String,
        format: String,
        unit_count: usize,
        batch_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// An episode unit moved to a new state
    UnitStateChanged {
        run_id: Uuid,
        subject_id: String,
        format: String,
        sequence_number: u32,
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// An episode record was written
    EpisodePersisted {
        run_id: Uuid,
        episode_id: String,
        sequence_number: u32,
        amendment_of: Option<u32>,
        content_hash: String,
        timestamp: DateTime<Utc>,
    },

    /// A generation run finished (successfully or not)
    GenerationCompleted {
        run_id: Uuid,
        subject_id: String,
        format: String,
        persisted: usize,
        skipped: usize,
        failed: usize,
        cancelled: usize,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::DiscoveryCompleted { .. } => "DiscoveryCompleted",
            PipelineEvent::GenerationStarted { .. } => "GenerationStarted",
            PipelineEvent::UnitStateChanged { .. } => "UnitStateChanged",
            PipelineEvent::EpisodePersisted { .. } => "EpisodePersisted",
            PipelineEvent::GenerationCompleted { .. } => "GenerationCompleted",
        }
    }
}

/// Broadcast bus for [`PipelineEvent`]s
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
