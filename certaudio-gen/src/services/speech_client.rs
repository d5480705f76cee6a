//! Speech synthesis (markup + voice + output format → audio bytes)

use super::http::{build_client, rate_limiter, DirectRateLimiter};
use crate::error::ExternalError;
use async_trait::async_trait;
use std::time::Duration;

/// Default synthesis output format
pub const DEFAULT_OUTPUT_FORMAT: &str = "audio-48khz-192kbitrate-mono-mp3";

const DEFAULT_BITRATE_BPS: u32 = 192_000;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one markup segment
    ///
    /// Must report [`ExternalError::InvalidMarkup`] for markup the service
    /// rejects and a transient error for service unavailability.
    async fn synthesize(
        &self,
        markup: &str,
        voice: &str,
        output_format: &str,
    ) -> Result<Vec<u8>, ExternalError>;
}

/// Bitrate encoded in an output format name (`...-192kbitrate-...`)
pub fn bitrate_bps(output_format: &str) -> u32 {
    output_format
        .split('-')
        .find_map(|part| part.strip_suffix("kbitrate"))
        .and_then(|kbps| kbps.parse::<u32>().ok())
        .map(|kbps| kbps * 1000)
        .unwrap_or(DEFAULT_BITRATE_BPS)
}

/// Duration of constant-bitrate audio from its byte length
pub fn estimate_duration_seconds(byte_len: usize, output_format: &str) -> f64 {
    (byte_len as f64 * 8.0) / bitrate_bps(output_format) as f64
}

/// REST text-to-speech client
pub struct HttpSpeechClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    rate_limiter: DirectRateLimiter,
}

impl HttpSpeechClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.to_string(),
            api_key,
            rate_limiter: rate_limiter(requests_per_second),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechClient {
    async fn synthesize(
        &self,
        markup: &str,
        voice: &str,
        output_format: &str,
    ) -> Result<Vec<u8>, ExternalError> {
        self.rate_limiter.until_ready().await;
        tracing::debug!(voice, chars = markup.len(), "Synthesizing segment");

        let mut call = self
            .client
            .post(&self.endpoint)
            .query(&[("voice", voice)])
            .header(reqwest::header::CONTENT_TYPE, "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", output_format)
            .body(markup.to_string());
        if let Some(key) = &self.api_key {
            call = call.header("Ocp-Apim-Subscription-Key", key);
        }
        let response = call.send().await?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                400 => ExternalError::InvalidMarkup(body),
                500..=599 => ExternalError::ServiceUnavailable(format!("HTTP {}: {}", status, body)),
                _ => ExternalError::from_status(status, retry_after, &body),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ExternalError::Transient(
                "Speech service returned no audio".into(),
            ));
        }
        Ok(bytes.to_vec())
    }
}
