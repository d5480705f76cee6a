//! Batch orchestrator
//!
//! Drives planned episode units through generation:
//!
//! # Unit state progression
//! PLANNED → GENERATING → AUDIO_SYNTHESIZING → UPLOADING → PERSISTED
//! (FAILED from any non-terminal state; PLANNED → PERSISTED when a record
//! already exists and regeneration is not forced)
//!
//! # Batches
//! Units are split into fixed-size batches processed one after another.
//! Within a batch:
//! - **GENERATING** (`phase_generating`): existence check, narration and
//!   markup, sequential per unit
//! - **SYNTHESIZING** (`phase_synthesizing`): speech synthesis on a bounded
//!   worker pool (`max_workers`)
//! - **FINALIZING** (`phase_finalizing`): uploads, Source linkage and the
//!   Episode Record write, sequential in sequence order
//!
//! A unit's failure is recorded in the run summary and never stops the batch.
//! A unit is persisted only after every sub-step has succeeded.

use crate::error::UnitFailure;
use crate::models::{
    DiscoveryResult, EpisodeUnit, RunSummary, StateTransition, Topic, UnitOutcome, UnitProgress,
    UnitReport, UnitState,
};
use crate::services::markup_converter::{MarkupConverter, VoiceSettings};
use crate::services::narration_client::{NarrationGenerator, NarrationStyle};
use crate::services::object_store::ObjectStore;
use crate::services::speech_client::{SpeechSynthesizer, DEFAULT_OUTPUT_FORMAT};
use crate::utils::RetryPolicy;
use certaudio_common::events::{EventBus, PipelineEvent};
use certaudio_common::{Error, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod phase_finalizing;
mod phase_generating;
mod phase_synthesizing;

/// Orchestrator knobs, passed in explicitly
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    /// Concurrent speech synthesis calls within a batch
    pub max_workers: usize,
    /// Regenerate units that already have a record
    pub force_regenerate: bool,
    pub retry: RetryPolicy,
    pub voices: VoiceSettings,
    pub output_format: String,
    pub narration_style: NarrationStyle,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_workers: 4,
            force_regenerate: false,
            retry: RetryPolicy::default(),
            voices: VoiceSettings::default(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            narration_style: NarrationStyle::default(),
        }
    }
}

/// External services used during generation
#[derive(Clone)]
pub struct Collaborators {
    pub narration: Arc<dyn NarrationGenerator>,
    pub markup: Arc<dyn MarkupConverter>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub objects: Arc<dyn ObjectStore>,
}

/// Unit that passed GENERATING
struct PreparedUnit<'a> {
    unit: &'a EpisodeUnit,
    progress: UnitProgress,
    topics: Vec<&'a Topic>,
    narration: String,
    segments: Vec<String>,
}

/// Unit that passed AUDIO_SYNTHESIZING
struct SynthesizedUnit<'a> {
    prepared: PreparedUnit<'a>,
    audio: Vec<u8>,
}

/// Identity of the current run, threaded through the phases
#[derive(Clone, Copy)]
struct RunContext<'a> {
    run_id: Uuid,
    result: &'a DiscoveryResult,
    cancel: &'a CancellationToken,
}

pub struct BatchOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    collaborators: Collaborators,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            collaborators,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Number of batches `unit_count` units are split into
    pub fn batch_count(&self, unit_count: usize) -> usize {
        unit_count.div_ceil(self.config.batch_size.max(1))
    }

    /// Generate `units` (all batches, or only `batch_index`)
    ///
    /// Cancellation is honored between batches and between units; units not
    /// started are reported as cancelled.
    pub async fn run(
        &self,
        result: &DiscoveryResult,
        units: &[EpisodeUnit],
        batch_index: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[EpisodeUnit]> = units.chunks(batch_size).collect();
        let format = units.first().map(|u| u.format).unwrap_or_default();

        let selected: Vec<(usize, &[EpisodeUnit])> = match batch_index {
            Some(index) if index >= batches.len() => {
                return Err(Error::InvalidInput(format!(
                    "Batch index {} out of range ({} batches of {})",
                    index,
                    batches.len(),
                    batch_size
                )));
            }
            Some(index) => vec![(index, batches[index])],
            None => batches.iter().copied().enumerate().collect(),
        };

        let unit_count: usize = selected.iter().map(|(_, b)| b.len()).sum();
        tracing::info!(
            run_id = %run_id,
            subject_id = %result.subject_id,
            format = %format,
            units = unit_count,
            batches = selected.len(),
            batch_size,
            max_workers = self.config.max_workers,
            force_regenerate = self.config.force_regenerate,
            "Generation run started"
        );
        self.event_bus.emit_lossy(PipelineEvent::GenerationStarted {
            run_id,
            subject_id: result.subject_id.clone(),
            format: format.to_string(),
            unit_count,
            batch_count: selected.len(),
            timestamp: Utc::now(),
        });

        let ctx = RunContext {
            run_id,
            result,
            cancel,
        };
        let mut reports = Vec::with_capacity(unit_count);

        for (index, batch) in selected {
            if cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, batch = index, "Run cancelled before batch");
                reports.extend(batch.iter().map(cancelled));
                continue;
            }

            tracing::info!(run_id = %run_id, batch = index, units = batch.len(), "Processing batch");
            let (prepared, mut batch_reports) = self.phase_generating(ctx, batch).await;
            let (synthesized, synth_reports) = self.phase_synthesizing(ctx, prepared).await;
            batch_reports.extend(synth_reports);
            batch_reports.extend(self.phase_finalizing(ctx, synthesized).await);

            batch_reports.sort_by_key(|r| r.sequence_number);
            reports.extend(batch_reports);
        }

        let summary = RunSummary {
            run_id,
            subject_id: result.subject_id.clone(),
            format,
            reports,
            started_at,
            ended_at: Utc::now(),
        };

        tracing::info!(
            run_id = %run_id,
            subject_id = %result.subject_id,
            persisted = summary.persisted(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            status = ?summary.status(),
            "Generation run completed"
        );
        self.event_bus.emit_lossy(PipelineEvent::GenerationCompleted {
            run_id,
            subject_id: result.subject_id.clone(),
            format: format.to_string(),
            persisted: summary.persisted(),
            skipped: summary.skipped(),
            failed: summary.failed(),
            cancelled: summary.cancelled(),
            timestamp: Utc::now(),
        });

        Ok(summary)
    }

    /// Apply a state transition and publish it
    fn transition(
        &self,
        ctx: RunContext<'_>,
        unit: &EpisodeUnit,
        progress: &mut UnitProgress,
        state: UnitState,
    ) -> Option<StateTransition> {
        let transition = progress.transition_to(state)?;
        tracing::debug!(
            run_id = %ctx.run_id,
            sequence_number = unit.sequence_number,
            from = transition.old_state,
            to = transition.new_state,
            "Unit state changed"
        );
        self.event_bus.emit_lossy(PipelineEvent::UnitStateChanged {
            run_id: ctx.run_id,
            subject_id: unit.subject_id.clone(),
            format: unit.format.to_string(),
            sequence_number: unit.sequence_number,
            state: transition.new_state.to_string(),
            timestamp: transition.transitioned_at,
        });
        Some(transition)
    }

    /// Move a unit to FAILED and build its report
    fn fail(
        &self,
        ctx: RunContext<'_>,
        unit: &EpisodeUnit,
        progress: &mut UnitProgress,
        reason: UnitFailure,
    ) -> UnitReport {
        tracing::warn!(
            run_id = %ctx.run_id,
            sequence_number = unit.sequence_number,
            state = progress.state.name(),
            reason = %reason,
            "Unit failed"
        );
        self.transition(
            ctx,
            unit,
            progress,
            UnitState::Failed {
                reason: reason.clone(),
            },
        );
        report(unit, UnitOutcome::Failed { reason })
    }
}

fn report(unit: &EpisodeUnit, outcome: UnitOutcome) -> UnitReport {
    UnitReport {
        sequence_number: unit.sequence_number,
        group_title: unit.group_title.clone(),
        outcome,
    }
}

fn cancelled(unit: &EpisodeUnit) -> UnitReport {
    report(unit, UnitOutcome::Cancelled)
}
