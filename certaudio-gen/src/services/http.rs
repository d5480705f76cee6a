//! Shared plumbing for the reqwest-based collaborator clients

use crate::error::ExternalError;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;

/// Direct (unkeyed) rate limiter used by every client
pub type DirectRateLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

const USER_AGENT: &str = concat!("certaudio-gen/", env!("CARGO_PKG_VERSION"));

/// Rate limiter allowing `requests_per_second` (minimum 1)
pub fn rate_limiter(requests_per_second: u32) -> DirectRateLimiter {
    let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    governor::RateLimiter::direct(governor::Quota::per_second(per_second))
}

/// HTTP client with the crate user agent and a transport-level timeout
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ExternalError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| ExternalError::Permanent(format!("Failed to build HTTP client: {}", e)))
}

/// Trim a trailing slash so paths can be appended with `format!`
pub fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success response onto an [`ExternalError`]
pub async fn error_for_status(response: reqwest::Response) -> ExternalError {
    let status = response.status().as_u16();
    let retry_after = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    ExternalError::from_status(status, retry_after, &body)
}

/// GET a JSON document
pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    limiter: &DirectRateLimiter,
    url: &str,
    query: &[(&str, String)],
) -> Result<T, ExternalError> {
    limiter.until_ready().await;
    tracing::debug!(url, "GET");

    let response = client.get(url).query(query).send().await?;
    if !response.status().is_success() {
        return Err(error_for_status(response).await);
    }
    Ok(response.json::<T>().await?)
}
