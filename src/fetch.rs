//! Network calls with retry, backoff, and rate limiting.
//!
//! Every upstream request made by an adapter goes through a
//! [`FetchExecutor`], which combines:
//!
//! - a bounded per-request timeout (configured on the `reqwest` client),
//! - a [`RetryPolicy`]: exponential backoff with jitter, capped attempts,
//! - the per-source [`TokenBucket`], one token per attempt.
//!
//! # Classification
//!
//! | Outcome | Handling |
//! |---------|----------|
//! | 2xx | success |
//! | 429 | retry, waiting at least the `Retry-After` hint |
//! | 5xx, transport error, timeout | retry with backoff |
//! | other 4xx, undecodable body | permanent, no retry |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::FetchError;
use crate::rate_limiter::TokenBucket;

/// Upper bound on how long a server-provided `Retry-After` can stall a page.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(600);

/// What a retry loop should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Retry, but wait at least this long.
    RetryAfter(Duration),
    Stop,
}

/// Reusable retry policy: attempt cap plus an exponential backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added or removed at random (0.0..=1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    pub fn with_multiplier(mut self, m: f64) -> Self {
        self.multiplier = m.max(1.0);
        self
    }

    pub fn with_jitter(mut self, j: f64) -> Self {
        self.jitter = j.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi((retry.min(30) - 1) as i32);
        let ms = self.initial_backoff.as_millis() as f64 * exp;
        Duration::from_millis(ms.min(self.max_backoff.as_millis() as f64) as u64)
    }

    /// Delay before retry number `retry`, with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base.as_millis() as f64 + offset).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, `classify` says stop, or attempts run out.
    pub async fn run<T, E, F, Fut, C>(&self, classify: C, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let decision = classify(&err);
                    if decision == RetryDecision::Stop || attempt >= self.max_attempts {
                        if decision != RetryDecision::Stop {
                            warn!(attempt, error = %err, "giving up after final attempt");
                        }
                        return Err(err);
                    }
                    let mut delay = self.delay(attempt);
                    if let RetryDecision::RetryAfter(hint) = decision {
                        delay = delay.max(hint.min(MAX_RETRY_AFTER));
                    }
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Retry classification for network fetches.
pub fn classify_fetch(err: &FetchError) -> RetryDecision {
    match err {
        FetchError::Permanent { .. } => RetryDecision::Stop,
        FetchError::Throttled {
            retry_after: Some(hint),
        } => RetryDecision::RetryAfter(*hint),
        FetchError::Throttled { retry_after: None }
        | FetchError::Transient(_)
        | FetchError::Timeout => RetryDecision::Retry,
    }
}

/// Map a response status to success or a classified error.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        Err(FetchError::Throttled { retry_after })
    } else if status.is_server_error() {
        Err(FetchError::Transient(format!("upstream returned {}", status)))
    } else {
        Err(FetchError::Permanent {
            status: Some(status.as_u16()),
            message: format!("upstream returned {}", status),
        })
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// HTTP client wrapper bound to one data source's rate limiter.
#[derive(Clone)]
pub struct FetchExecutor {
    client: reqwest::Client,
    policy: RetryPolicy,
    limiter: Arc<TokenBucket>,
}

impl FetchExecutor {
    pub fn new(client: reqwest::Client, policy: RetryPolicy, limiter: Arc<TokenBucket>) -> Self {
        Self {
            client,
            policy,
            limiter,
        }
    }

    /// Build the shared `reqwest` client with the configured timeout.
    pub fn build_client(http: &HttpConfig) -> Result<reqwest::Client, FetchError> {
        reqwest::Client::builder()
            .timeout(http.timeout())
            .user_agent(http.user_agent.clone())
            .build()
            .map_err(|e| FetchError::permanent(format!("failed to build HTTP client: {}", e)))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a request built by `build` under the retry policy and return the
    /// response body as text.
    pub async fn send_text<B>(&self, build: B) -> Result<String, FetchError>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.policy
            .run(classify_fetch, |attempt| {
                let request = build(&self.client);
                async move {
                    self.limiter.acquire().await;
                    debug!(attempt, "sending upstream request");
                    let response = request.send().await?;
                    classify_status(response.status(), response.headers())?;
                    Ok::<_, FetchError>(response.text().await?)
                }
            })
            .await
    }

    pub async fn get_text(&self, url: &str, headers: &[(&str, String)]) -> Result<String, FetchError> {
        self.send_text(|client| {
            let mut req = client.get(url);
            for (name, value) in headers {
                req = req.header(*name, value.as_str());
            }
            req
        })
        .await
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let body = self
            .send_text(|client| {
                let mut req = client.get(url).query(query);
                for (name, value) in headers {
                    req = req.header(*name, value.as_str());
                }
                req
            })
            .await?;
        decode_json(&body)
    }

    pub async fn post_json(
        &self,
        url: &str,
        payload: &serde_json::Value,
        headers: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let body = self
            .send_text(|client| {
                let mut req = client.post(url).json(payload);
                for (name, value) in headers {
                    req = req.header(*name, value.as_str());
                }
                req
            })
            .await?;
        decode_json(&body)
    }
}

fn decode_json(body: &str) -> Result<serde_json::Value, FetchError> {
    serde_json::from_str(body)
        .map_err(|e| FetchError::permanent(format!("invalid JSON from upstream: {}", e)))
}
