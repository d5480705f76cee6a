//! GENERATING phase
//!
//! Sequential per unit, to respect narration rate limits and keep ordering
//! deterministic: existence check, narration, markup conversion.

use super::{cancelled, report, BatchOrchestrator, PreparedUnit, RunContext};
use crate::db;
use crate::error::UnitFailure;
use crate::models::{EpisodeUnit, Topic, UnitOutcome, UnitProgress, UnitReport, UnitState};
use crate::services::narration_client::{NarrationRequest, NarrationTopic};
use crate::utils::with_retry;

impl BatchOrchestrator {
    pub(super) async fn phase_generating<'a>(
        &self,
        ctx: RunContext<'a>,
        batch: &'a [EpisodeUnit],
    ) -> (Vec<PreparedUnit<'a>>, Vec<UnitReport>) {
        let mut prepared = Vec::with_capacity(batch.len());
        let mut reports = Vec::new();

        for unit in batch {
            if ctx.cancel.is_cancelled() {
                reports.push(cancelled(unit));
                continue;
            }

            let mut progress = UnitProgress::new(unit.sequence_number);

            let exists = db::episodes::exists(
                &self.db,
                &unit.subject_id,
                unit.format,
                unit.sequence_number,
            )
            .await;
            match exists {
                Ok(true) if !self.config.force_regenerate => {
                    self.transition(ctx, unit, &mut progress, UnitState::Persisted);
                    tracing::debug!(
                        run_id = %ctx.run_id,
                        sequence_number = unit.sequence_number,
                        "Episode record exists, skipping"
                    );
                    reports.push(report(
                        unit,
                        UnitOutcome::Skipped {
                            episode_id: unit.episode_id(),
                        },
                    ));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = UnitFailure::storage("existence_check", e);
                    reports.push(self.fail(ctx, unit, &mut progress, reason));
                    continue;
                }
            }

            self.transition(ctx, unit, &mut progress, UnitState::Generating);
            match self.generate_unit(ctx, unit).await {
                Ok((topics, narration, segments)) => prepared.push(PreparedUnit {
                    unit,
                    progress,
                    topics,
                    narration,
                    segments,
                }),
                Err(reason) => reports.push(self.fail(ctx, unit, &mut progress, reason)),
            }
        }

        (prepared, reports)
    }

    /// Narration and markup for one unit
    async fn generate_unit<'a>(
        &self,
        ctx: RunContext<'a>,
        unit: &EpisodeUnit,
    ) -> Result<(Vec<&'a Topic>, String, Vec<String>), UnitFailure> {
        let mut topics = Vec::with_capacity(unit.topic_ids.len());
        for topic_id in &unit.topic_ids {
            match ctx.result.topic(topic_id) {
                Some(topic) => topics.push(topic),
                None => {
                    return Err(UnitFailure::MissingTopic {
                        topic_id: topic_id.clone(),
                    })
                }
            }
        }

        let request = NarrationRequest {
            subject_id: unit.subject_id.clone(),
            format: unit.format,
            sequence_number: unit.sequence_number,
            episode_title: unit.title(),
            topics: topics
                .iter()
                .map(|t| NarrationTopic {
                    title: t.title.clone(),
                    reference_text: t.reference_text.clone(),
                    source_urls: t.source_urls.clone(),
                })
                .collect(),
            amendment_of: unit.amendment_of,
            instruction: unit.instruction.clone(),
            style: self.config.narration_style.clone(),
        };

        let narration_client = &self.collaborators.narration;
        let narration = with_retry(&self.config.retry, "narration", || {
            narration_client.generate(&request)
        })
        .await
        .map_err(|e| UnitFailure::from_retry("narration", &e))?;

        let markup = &self.collaborators.markup;
        let voices = &self.config.voices;
        let segments = with_retry(&self.config.retry, "markup", || {
            markup.to_markup(&narration, unit.format, voices)
        })
        .await
        .map_err(|e| UnitFailure::from_retry("markup", &e))?;

        tracing::debug!(
            run_id = %ctx.run_id,
            sequence_number = unit.sequence_number,
            words = narration.split_whitespace().count(),
            segments = segments.len(),
            "Narration generated"
        );
        Ok((topics, narration, segments))
    }
}
