//! Resilient Request Client
//!
//! One call primitive for every request to the generation endpoint: bounded
//! retries with exponential backoff, an immediate failure on HTTP 400, and an
//! optional single-shot degradation of the payload when the server rejects a
//! capability the request asked for.

use crate::{Event, LogCategory, emit, error::ApiError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A raw HTTP response: status code and body text.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// The network boundary. Production uses [`ReqwestTransport`]; tests mock it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POSTs `body` as JSON. An `Err` means no response was received at all.
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, String>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, String> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e.without_url()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {}", e.without_url()))?;
        Ok(HttpResponse { status, body })
    }
}

/// How many times to try and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the failed attempt `attempt` (0-indexed): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Rewrites a rejected payload into a lower-capability form.
pub trait DegradationStrategy: Send + Sync {
    /// Returns the degraded payload, or `None` if there is nothing to degrade.
    fn degrade(&self, payload: &Value) -> Option<Value>;
}

/// Drops `generationConfig`, turning a structured-output request into a
/// plain-text one.
pub struct PlainTextFallback;

impl DegradationStrategy for PlainTextFallback {
    fn degrade(&self, payload: &Value) -> Option<Value> {
        let mut degraded = payload.clone();
        degraded.as_object_mut()?.remove("generationConfig")?;
        Some(degraded)
    }
}

/// What to return once the last attempt has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exhaustion {
    /// Wrap the last failure in [`ApiError::ExhaustedRetries`].
    Wrap,
    /// Return the last failure as-is.
    Surface,
}

/// Performs JSON requests with retries, backoff and optional degradation.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    events: Option<mpsc::Sender<Event>>,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            events: None,
        }
    }

    /// Retry notices are sent to `events` as `retry-notice` log lines.
    pub fn with_events(mut self, events: mpsc::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends `payload` with the client's retry policy.
    pub async fn send(&self, endpoint: &str, payload: &Value) -> Result<Value, ApiError> {
        self.send_with_policy(endpoint, payload, self.policy, Exhaustion::Wrap)
            .await
    }

    /// Sends `payload`; if the server answers 400 and `fallback` can degrade
    /// the payload, sends the degraded payload exactly once.
    pub async fn call(
        &self,
        endpoint: &str,
        payload: &Value,
        fallback: Option<&dyn DegradationStrategy>,
    ) -> Result<Value, ApiError> {
        match self.send(endpoint, payload).await {
            Err(err) if err.is_bad_request() => {
                let Some(degraded) = fallback.and_then(|f| f.degrade(payload)) else {
                    return Err(err);
                };
                warn!(error = %err, "Request rejected. Retrying once in degraded mode.");
                self.send_with_policy(
                    endpoint,
                    &degraded,
                    RetryPolicy::single_shot(),
                    Exhaustion::Surface,
                )
                .await
            }
            other => other,
        }
    }

    async fn send_with_policy(
        &self,
        endpoint: &str,
        payload: &Value,
        policy: RetryPolicy,
        exhaustion: Exhaustion,
    ) -> Result<Value, ApiError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match self.attempt(endpoint, payload).await {
                Ok(body) => return Ok(body),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            warn!(attempt = attempt + 1, max_attempts, error = %err, "Request attempt failed");
            if attempt + 1 >= max_attempts {
                if exhaustion == Exhaustion::Surface {
                    return Err(err);
                }
                return Err(ApiError::ExhaustedRetries {
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }

            emit(
                &self.events,
                Event::log(
                    format!(
                        "... Falha na conexão. Retentativa {}/{} ...",
                        attempt + 1,
                        max_attempts
                    ),
                    LogCategory::RetryNotice,
                ),
            )
            .await;
            let delay = policy.delay_for(attempt);
            debug!(?delay, "Backing off before retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, endpoint: &str, payload: &Value) -> Result<Value, ApiError> {
        let response = self
            .transport
            .post_json(endpoint, payload)
            .await
            .map_err(|e| ApiError::transient(None, e))?;

        match response.status {
            400 => {
                info!(body = %response.body, "Server rejected the request with HTTP 400");
                Err(ApiError::BadRequest(
                    "possible structured-output mismatch".to_string(),
                ))
            }
            200..=299 => serde_json::from_str(&response.body).map_err(|e| {
                ApiError::transient(
                    Some(response.status),
                    format!("response body is not JSON: {}", e),
                )
            }),
            status => Err(ApiError::transient(
                Some(status),
                format!("HTTP {}", status),
            )),
        }
    }
}
