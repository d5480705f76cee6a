//! Narrated text → SSML segments
//!
//! Speaker markers (`[HOST]`, `[EXPERT]`) switch voices in podcast-duo
//! narration and are stripped otherwise. `[PAUSE]` becomes a break. Output is
//! split into segments no longer than `max_segment_chars` so that each one
//! stays under the speech service's request limit; segments are synthesized
//! separately and the audio is concatenated.

use crate::error::ExternalError;
use crate::models::NarrationFormat;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const PAUSE_MARKER: &str = "[PAUSE]";
const HOST_MARKER: &str = "[HOST]";
const EXPERT_MARKER: &str = "[EXPERT]";
const BREAK_TAG: &str = r#"<break time="750ms"/>"#;

/// Default maximum characters of SSML body per segment
pub const DEFAULT_MAX_SEGMENT_CHARS: usize = 4500;

/// Voice names per narration role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub instructional: String,
    pub podcast_host: String,
    pub podcast_expert: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            instructional: "en-US-AndrewNeural".to_string(),
            podcast_host: "en-US-GuyNeural".to_string(),
            podcast_expert: "en-US-TonyNeural".to_string(),
        }
    }
}

impl VoiceSettings {
    /// Voice that opens an episode of the given format
    pub fn primary(&self, format: NarrationFormat) -> &str {
        match format {
            NarrationFormat::Instructional => &self.instructional,
            NarrationFormat::PodcastSolo | NarrationFormat::PodcastDuo => &self.podcast_host,
        }
    }
}

#[async_trait]
pub trait MarkupConverter: Send + Sync {
    /// Convert narration into one or more speech-markup segments
    async fn to_markup(
        &self,
        narration: &str,
        format: NarrationFormat,
        voices: &VoiceSettings,
    ) -> Result<Vec<String>, ExternalError>;
}

/// Local SSML converter
#[derive(Debug, Clone)]
pub struct SsmlConverter {
    max_segment_chars: usize,
}

impl Default for SsmlConverter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEGMENT_CHARS)
    }
}

/// One rendered piece of a voice block
#[derive(Debug, Clone, PartialEq)]
struct Fragment<'v> {
    voice: &'v str,
    body: String,
}

impl SsmlConverter {
    pub fn new(max_segment_chars: usize) -> Self {
        Self {
            max_segment_chars: max_segment_chars.max(200),
        }
    }

    fn fragments<'v>(
        &self,
        narration: &str,
        format: NarrationFormat,
        voices: &'v VoiceSettings,
    ) -> Vec<Fragment<'v>> {
        let mut voice: &'v str = voices.primary(format);
        let mut fragments = Vec::new();
        let budget = self.max_segment_chars * 4 / 5;

        for line in narration.lines() {
            let mut text = line.trim();
            if text.is_empty() {
                continue;
            }

            if let Some(rest) = text.strip_prefix(HOST_MARKER) {
                if format == NarrationFormat::PodcastDuo {
                    voice = &voices.podcast_host;
                }
                text = rest.trim_start_matches(':').trim();
            } else if let Some(rest) = text.strip_prefix(EXPERT_MARKER) {
                if format == NarrationFormat::PodcastDuo {
                    voice = &voices.podcast_expert;
                }
                text = rest.trim_start_matches(':').trim();
            }

            if text == PAUSE_MARKER {
                fragments.push(Fragment {
                    voice,
                    body: BREAK_TAG.to_string(),
                });
                continue;
            }
            if text.is_empty() {
                continue;
            }

            for piece in split_sentences(text, budget) {
                let body = escape_xml(&piece).replace(PAUSE_MARKER, BREAK_TAG);
                fragments.push(Fragment {
                    voice,
                    body: format!("<p>{}</p>", body),
                });
            }
        }
        fragments
    }

    /// Synchronous conversion used by the trait implementation
    pub fn convert(
        &self,
        narration: &str,
        format: NarrationFormat,
        voices: &VoiceSettings,
    ) -> Result<Vec<String>, ExternalError> {
        let fragments = self.fragments(narration, format, voices);
        if !fragments.iter().any(|f| f.body.starts_with("<p>")) {
            return Err(ExternalError::InvalidMarkup(
                "narration contains no speakable text".to_string(),
            ));
        }

        let mut segments = Vec::new();
        let mut current: Vec<Fragment> = Vec::new();
        let mut current_len = 0usize;

        for fragment in fragments {
            if !current.is_empty() && current_len + fragment.body.len() > self.max_segment_chars {
                segments.push(render_segment(&current));
                current.clear();
                current_len = 0;
            }
            current_len += fragment.body.len();
            current.push(fragment);
        }
        if !current.is_empty() {
            segments.push(render_segment(&current));
        }
        Ok(segments)
    }
}

#[async_trait]
impl MarkupConverter for SsmlConverter {
    async fn to_markup(
        &self,
        narration: &str,
        format: NarrationFormat,
        voices: &VoiceSettings,
    ) -> Result<Vec<String>, ExternalError> {
        self.convert(narration, format, voices)
    }
}

fn render_segment(fragments: &[Fragment]) -> String {
    let mut ssml = String::from(
        r#"<speak version="1.0" xmlns="http://www.w3.org/2001/10/synthesis" xml:lang="en-US">"#,
    );
    let mut open_voice: Option<&str> = None;

    for fragment in fragments {
        if open_voice != Some(fragment.voice) {
            if open_voice.is_some() {
                ssml.push_str("</voice>");
            }
            ssml.push_str(&format!(r#"<voice name="{}">"#, escape_xml(fragment.voice)));
            open_voice = Some(fragment.voice);
        }
        ssml.push_str(&fragment.body);
    }
    if open_voice.is_some() {
        ssml.push_str("</voice>");
    }
    ssml.push_str("</speak>");
    ssml
}

/// Split text into sentence-aligned pieces of at most `budget` bytes
fn split_sentences(text: &str, budget: usize) -> Vec<String> {
    if text.len() <= budget {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let ends_sentence = word.ends_with('.') || word.ends_with('?') || word.ends_with('!');
        if !current.is_empty() && current.len() + word.len() + 1 > budget {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
        if ends_sentence && current.len() > budget / 2 {
            pieces.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
