//! Narration generation (topic set + format + style → narrated text)
//!
//! The HTTP implementation speaks the OpenAI-compatible chat completions
//! protocol. Content-filter refusals are reported as
//! [`ExternalError::ContentPolicy`] so they are never retried.

use super::http::{base_url, build_client, error_for_status, rate_limiter, DirectRateLimiter};
use crate::error::ExternalError;
use crate::models::NarrationFormat;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Style parameters for one narration call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationStyle {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Target spoken length
    pub target_minutes: u32,
}

impl Default for NarrationStyle {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4000,
            target_minutes: 10,
        }
    }
}

/// Topic content handed to narration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationTopic {
    pub title: String,
    pub reference_text: String,
    pub source_urls: Vec<String>,
}

/// Everything narration needs for one episode unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationRequest {
    pub subject_id: String,
    pub format: NarrationFormat,
    pub sequence_number: u32,
    pub episode_title: String,
    pub topics: Vec<NarrationTopic>,
    /// Amendment framing; `Some` only for amendment units
    pub amendment_of: Option<u32>,
    pub instruction: Option<String>,
    pub style: NarrationStyle,
}

#[async_trait]
pub trait NarrationGenerator: Send + Sync {
    async fn generate(&self, request: &NarrationRequest) -> Result<String, ExternalError>;
}

/// System and user prompts for a request
pub fn build_prompts(request: &NarrationRequest) -> (String, String) {
    let voice = match request.format {
        NarrationFormat::Instructional => {
            "You are an experienced instructor recording a certification study course. \
             Speak directly to the learner in a clear, structured way."
        }
        NarrationFormat::PodcastSolo => {
            "You are the host of a conversational certification-prep podcast. \
             Keep an engaging, informal tone while staying technically precise."
        }
        NarrationFormat::PodcastDuo => {
            "You write a two-person certification-prep podcast between a HOST and an EXPERT. \
             Start every speaker turn on its own line with [HOST] or [EXPERT]."
        }
    };
    let system = format!(
        "{} Write plain spoken text only, no markdown, no headings. \
         Use [PAUSE] on its own line for a short pause. \
         Aim for roughly {} minutes of speech.",
        voice, request.style.target_minutes
    );

    let mut user = format!(
        "Subject: {}\nEpisode {}: {}\n\n",
        request.subject_id, request.sequence_number, request.episode_title
    );

    if let (Some(prior), Some(instruction)) = (request.amendment_of, &request.instruction) {
        user.push_str(&format!(
            "This episode updates episode {}.\n{}\n\n",
            prior, instruction
        ));
    }

    user.push_str("Cover the following topics in order, using only the reference material:\n");
    for (idx, topic) in request.topics.iter().enumerate() {
        user.push_str(&format!("\n### {}. {}\n", idx + 1, topic.title));
        if topic.reference_text.trim().is_empty() {
            user.push_str("(No reference text available; give a brief overview only.)\n");
        } else {
            user.push_str(topic.reference_text.trim());
            user.push('\n');
        }
        if !topic.source_urls.is_empty() {
            user.push_str(&format!("Sources: {}\n", topic.source_urls.join(", ")));
        }
    }

    (system, user)
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client
pub struct HttpNarrationClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    rate_limiter: DirectRateLimiter,
}

impl HttpNarrationClient {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: base_url(endpoint),
            model: model.to_string(),
            api_key,
            rate_limiter: rate_limiter(requests_per_second),
        })
    }
}

fn is_content_filter(body: &str) -> bool {
    body.contains("content_filter") || body.contains("content_policy")
}

#[async_trait]
impl NarrationGenerator for HttpNarrationClient {
    async fn generate(&self, request: &NarrationRequest) -> Result<String, ExternalError> {
        let (system, user) = build_prompts(request);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": request.style.temperature,
            "max_tokens": request.style.max_tokens,
        });

        self.rate_limiter.until_ready().await;
        tracing::debug!(
            sequence_number = request.sequence_number,
            topics = request.topics.len(),
            "Requesting narration"
        );

        let mut call = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key).header("api-key", key);
        }
        let response = call.send().await?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            return Err(if is_content_filter(&text) {
                ExternalError::ContentPolicy(text)
            } else {
                ExternalError::from_status(400, None, &text)
            });
        }
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ExternalError::Permanent("Narration response had no choices".into()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ExternalError::ContentPolicy(
                "Narration output was filtered".into(),
            ));
        }

        let text = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ExternalError::Transient("Narration response was empty".into()));
        }
        Ok(text)
    }
}
