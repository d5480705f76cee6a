//! AUDIO_SYNTHESIZING phase
//!
//! Synthesis dominates latency, so units run on a bounded worker pool.
//! Completion order does not matter: every result is written to its
//! already-assigned sequence number during finalizing.

use super::{cancelled, BatchOrchestrator, PreparedUnit, RunContext, SynthesizedUnit};
use crate::error::UnitFailure;
use crate::models::{UnitReport, UnitState};
use crate::utils::with_retry;
use futures::stream::{self, StreamExt};

enum SynthesisOutcome<'a> {
    Done(SynthesizedUnit<'a>),
    Report(UnitReport),
}

impl BatchOrchestrator {
    pub(super) async fn phase_synthesizing<'a>(
        &self,
        ctx: RunContext<'a>,
        prepared: Vec<PreparedUnit<'a>>,
    ) -> (Vec<SynthesizedUnit<'a>>, Vec<UnitReport>) {
        let workers = self.config.max_workers.max(1);

        let outcomes: Vec<SynthesisOutcome<'a>> = stream::iter(prepared)
            .map(|mut unit| async move {
                if ctx.cancel.is_cancelled() {
                    return SynthesisOutcome::Report(cancelled(unit.unit));
                }

                self.transition(ctx, unit.unit, &mut unit.progress, UnitState::AudioSynthesizing);
                match self.synthesize_segments(&unit).await {
                    Ok(audio) => SynthesisOutcome::Done(SynthesizedUnit {
                        prepared: unit,
                        audio,
                    }),
                    Err(reason) => SynthesisOutcome::Report(self.fail(
                        ctx,
                        unit.unit,
                        &mut unit.progress,
                        reason,
                    )),
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut synthesized = Vec::new();
        let mut reports = Vec::new();
        for outcome in outcomes {
            match outcome {
                SynthesisOutcome::Done(unit) => synthesized.push(unit),
                SynthesisOutcome::Report(report) => reports.push(report),
            }
        }
        synthesized.sort_by_key(|s| s.prepared.unit.sequence_number);

        tracing::debug!(
            run_id = %ctx.run_id,
            synthesized = synthesized.len(),
            not_synthesized = reports.len(),
            workers,
            "Synthesis phase completed"
        );
        (synthesized, reports)
    }

    /// Synthesize every markup segment and concatenate the audio
    async fn synthesize_segments(&self, unit: &PreparedUnit<'_>) -> Result<Vec<u8>, UnitFailure> {
        let speech = &self.collaborators.speech;
        let voice = self.config.voices.primary(unit.unit.format);
        let output_format = self.config.output_format.as_str();
        let mut audio = Vec::new();

        for (index, segment) in unit.segments.iter().enumerate() {
            let bytes = with_retry(&self.config.retry, "speech_synthesis", || {
                speech.synthesize(segment, voice, output_format)
            })
            .await
            .map_err(|e| UnitFailure::from_retry("speech_synthesis", &e))?;

            tracing::debug!(
                sequence_number = unit.unit.sequence_number,
                segment = index + 1,
                segments = unit.segments.len(),
                bytes = bytes.len(),
                "Segment synthesized"
            );
            audio.extend_from_slice(&bytes);
        }

        Ok(audio)
    }
}
