//! HTTP read API for certaudio-gen
//!
//! Read-only JSON endpoints over discovery results and episode records, plus
//! an SSE stream of pipeline events for progress tracking.

pub mod health;
pub mod sse;
pub mod subjects;

pub use health::health_routes;
pub use sse::event_stream;
pub use subjects::subject_routes;
