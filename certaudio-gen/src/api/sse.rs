//! Server-Sent Events stream of pipeline progress

use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use certaudio_common::events::PipelineEvent;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    /// Only forward events of this subject
    pub subject: Option<String>,
}

fn subject_of(event: &PipelineEvent) -> Option<&str> {
    match event {
        PipelineEvent::DiscoveryCompleted { subject_id, .. }
        | PipelineEvent::GenerationStarted { subject_id, .. }
        | PipelineEvent::UnitStateChanged { subject_id, .. }
        | PipelineEvent::GenerationCompleted { subject_id, .. } => Some(subject_id.as_str()),
        PipelineEvent::EpisodePersisted { .. } => None,
    }
}

/// GET /events - discovery completed, unit state changes, episodes persisted, runs completed
pub async fn event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(subject = ?filter.subject, "New SSE client connected");
    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    // episode events carry no subject; forward them unfiltered
                    let wanted = match (&filter.subject, subject_of(&event)) {
                        (Some(wanted), Some(subject)) => wanted == subject,
                        _ => true,
                    };
                    if !wanted {
                        continue;
                    }

                    let event_type = event.event_type();
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            debug!("SSE: Broadcasting event: {}", event_type);
                            yield Ok(Event::default().event(event_type).data(json));
                        }
                        Err(e) => warn!("SSE: Failed to serialize event {}: {}", event_type, e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE: Client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
