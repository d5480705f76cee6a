//! UPLOADING phase and record persistence
//!
//! Sequential in sequence order. Writes are ordered artifacts → Source
//! linkage → Episode Record, so a record never points at missing objects.
//! A new episode that fails part way has its uploaded objects removed.

use super::{cancelled, report, BatchOrchestrator, RunContext, SynthesizedUnit};
use crate::db;
use crate::error::UnitFailure;
use crate::models::{
    ArtifactPaths, EpisodeRecord, EpisodeRef, EpisodeUnit, UnitOutcome, UnitReport, UnitState,
};
use crate::services::content_hasher::episode_digest;
use crate::services::speech_client::estimate_duration_seconds;
use crate::utils::with_retry;
use certaudio_common::events::PipelineEvent;
use chrono::Utc;
use std::collections::BTreeMap;

struct UploadedUrls {
    audio: String,
    script: String,
    markup: String,
}

impl BatchOrchestrator {
    pub(super) async fn phase_finalizing<'a>(
        &self,
        ctx: RunContext<'a>,
        synthesized: Vec<SynthesizedUnit<'a>>,
    ) -> Vec<UnitReport> {
        let mut reports = Vec::with_capacity(synthesized.len());

        for mut item in synthesized {
            let unit = item.prepared.unit;
            if ctx.cancel.is_cancelled() {
                tracing::info!(
                    run_id = %ctx.run_id,
                    sequence_number = unit.sequence_number,
                    "Run cancelled, abandoning synthesized unit"
                );
                reports.push(cancelled(unit));
                continue;
            }

            self.transition(ctx, unit, &mut item.prepared.progress, UnitState::Uploading);
            let outcome = self.finalize_unit(&item).await;
            match outcome {
                Ok(record) => {
                    self.transition(ctx, unit, &mut item.prepared.progress, UnitState::Persisted);
                    tracing::info!(
                        run_id = %ctx.run_id,
                        episode_id = %record.id,
                        sequence_number = record.sequence_number,
                        amendment_of = ?record.amendment_of,
                        duration_seconds = record.duration_seconds,
                        "Episode persisted"
                    );
                    self.event_bus.emit_lossy(PipelineEvent::EpisodePersisted {
                        run_id: ctx.run_id,
                        episode_id: record.id.clone(),
                        sequence_number: record.sequence_number,
                        amendment_of: record.amendment_of,
                        content_hash: record.content_hash.clone(),
                        timestamp: Utc::now(),
                    });
                    reports.push(report(
                        unit,
                        UnitOutcome::Persisted {
                            episode_id: record.id,
                        },
                    ));
                }
                Err(reason) => {
                    reports.push(self.fail(ctx, unit, &mut item.prepared.progress, reason));
                }
            }
        }

        reports
    }

    async fn finalize_unit(
        &self,
        item: &SynthesizedUnit<'_>,
    ) -> Result<EpisodeRecord, UnitFailure> {
        let prepared = &item.prepared;
        let unit = prepared.unit;

        let topic_hashes: BTreeMap<String, String> = prepared
            .topics
            .iter()
            .filter_map(|t| t.content_hash.as_ref().map(|h| (t.id.clone(), h.clone())))
            .collect();
        let mut source_urls: Vec<String> = Vec::new();
        for url in prepared.topics.iter().flat_map(|t| t.source_urls.iter()) {
            if !source_urls.contains(url) {
                source_urls.push(url.clone());
            }
        }

        let title = unit.title();
        let script = render_script(&title, &prepared.narration, &source_urls);
        let urls = match self
            .upload_artifacts(item, script, prepared.segments.join("\n"))
            .await
        {
            Ok(urls) => urls,
            Err(reason) => {
                self.discard_artifacts(unit).await;
                return Err(reason);
            }
        };

        let episode = EpisodeRef {
            format: unit.format,
            sequence_number: unit.sequence_number,
        };
        if let Err(e) = db::sources::add_episode_ref(
            &self.db,
            &unit.subject_id,
            &unit.topic_ids,
            &topic_hashes,
            &episode,
        )
        .await
        {
            self.discard_artifacts(unit).await;
            return Err(UnitFailure::storage("source_linkage", e));
        }

        let record = EpisodeRecord {
            id: unit.episode_id(),
            subject_id: unit.subject_id.clone(),
            format: unit.format,
            sequence_number: unit.sequence_number,
            title,
            group_title: unit.group_title.clone(),
            topic_ids: unit.topic_ids.clone(),
            content_hash: episode_digest(&topic_hashes),
            topic_hashes,
            audio_url: urls.audio,
            script_url: urls.script,
            markup_url: urls.markup,
            duration_seconds: estimate_duration_seconds(item.audio.len(), &self.config.output_format),
            word_count: prepared.narration.split_whitespace().count(),
            amendment_of: unit.amendment_of,
            source_urls,
            created_at: Utc::now(),
        };
        if let Err(e) = db::episodes::save_record(&self.db, &record, self.config.force_regenerate).await {
            self.discard_artifacts(unit).await;
            return Err(UnitFailure::storage("episode_record", e));
        }

        Ok(record)
    }

    /// Remove objects a failed unit left behind
    ///
    /// Forced runs keep them: the existing record still points there.
    async fn discard_artifacts(&self, unit: &EpisodeUnit) {
        if self.config.force_regenerate {
            return;
        }
        let paths = ArtifactPaths::new(&unit.subject_id, unit.format, unit.sequence_number);
        for path in [&paths.audio, &paths.script, &paths.markup] {
            if let Err(e) = self.collaborators.objects.delete(path).await {
                tracing::warn!(
                    sequence_number = unit.sequence_number,
                    path = %path,
                    error = %e,
                    "Could not remove artifact of failed episode"
                );
            }
        }
    }

    async fn upload_artifacts(
        &self,
        item: &SynthesizedUnit<'_>,
        script_text: String,
        markup_text: String,
    ) -> Result<UploadedUrls, UnitFailure> {
        let unit = item.prepared.unit;
        let paths = ArtifactPaths::new(&unit.subject_id, unit.format, unit.sequence_number);
        let objects = &self.collaborators.objects;
        let retry = &self.config.retry;

        let audio = with_retry(retry, "upload_audio", || {
            objects.put(&paths.audio, item.audio.clone(), "audio/mpeg")
        })
        .await
        .map_err(|e| UnitFailure::from_retry("upload_audio", &e))?;

        let script = with_retry(retry, "upload_script", || {
            objects.put(&paths.script, script_text.clone().into_bytes(), "text/markdown")
        })
        .await
        .map_err(|e| UnitFailure::from_retry("upload_script", &e))?;

        let markup = with_retry(retry, "upload_markup", || {
            objects.put(&paths.markup, markup_text.clone().into_bytes(), "application/ssml+xml")
        })
        .await
        .map_err(|e| UnitFailure::from_retry("upload_markup", &e))?;

        Ok(UploadedUrls {
            audio,
            script,
            markup,
        })
    }
}

fn render_script(title: &str, narration: &str, source_urls: &[String]) -> String {
    let mut script = format!("# {}\n\n{}\n", title, narration.trim());
    if !source_urls.is_empty() {
        script.push_str("\n## Sources\n\n");
        for url in source_urls {
            script.push_str(&format!("- {}\n", url));
        }
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_script_lists_sources() {
        let script = render_script(
            "Update: Storage",
            "  Hello there.\n",
            &["https://a".to_string(), "https://b".to_string()],
        );
        assert!(script.starts_with("# Update: Storage\n\nHello there.\n"));
        assert!(script.ends_with("## Sources\n\n- https://a\n- https://b\n"));
    }
}
