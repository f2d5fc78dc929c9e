//! Fetch units, outcomes and the single-request HTTP fetcher shared by all providers.
//!
//! A provider implements [`UnitFetcher`] once per resource kind. The
//! [`pool::BoundedFetcher`] and [`paginator::collect_pages`] drivers only ever
//! talk to that trait, so they are tested with in-memory fakes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;

pub mod paginator;
pub mod pool;

/// One page or one sub-resource request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FetchUnit {
    Page(u32),
    Resource(i64),
    Url(String),
}

impl fmt::Display for FetchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchUnit::Page(n) => write!(f, "page {}", n),
            FetchUnit::Resource(id) => write!(f, "resource {}", id),
            FetchUnit::Url(url) => write!(f, "{}", redact_url(url)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Success(T),
    Retryable(FetchError),
    Fatal(FetchError),
}

impl<T> FetchOutcome<T> {
    pub fn from_result(result: Result<T, FetchError>) -> Self {
        match result {
            Ok(value) => FetchOutcome::Success(value),
            Err(err) if err.is_retryable() => FetchOutcome::Retryable(err),
            Err(err) => FetchOutcome::Fatal(err),
        }
    }
}

/// Capability implemented per provider resource: map a unit to an outcome.
/// Implementations never retry internally.
#[async_trait]
pub trait UnitFetcher: Send + Sync {
    type Output: Send;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempt passes after the initial one.
    pub rounds: usize,
    /// Pause before each re-attempt pass.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rounds: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Fetch a single unit, re-attempting retryable failures up to `policy.rounds` times.
pub async fn fetch_with_retry<F>(
    fetcher: &F,
    unit: &FetchUnit,
    policy: &RetryPolicy,
) -> Result<F::Output, FetchError>
where
    F: UnitFetcher + ?Sized,
{
    let mut round = 0;
    loop {
        match fetcher.fetch(unit).await {
            FetchOutcome::Success(value) => return Ok(value),
            FetchOutcome::Fatal(err) => return Err(err),
            FetchOutcome::Retryable(err) => {
                if round >= policy.rounds {
                    return Err(err);
                }
                round += 1;
                warn!(%unit, round, error = %err, "retrying unit");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Provider-specific reading of a non-success response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub message: String,
    pub permanent: bool,
}

pub type ErrorInterpreter = fn(StatusCode, &str) -> ProviderFailure;

/// Client errors mean bad credentials or a malformed query, except for
/// request timeouts and rate limiting.
pub fn is_permanent_status(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

/// Replace the `api_key` query value so URLs are safe to log.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.query().is_none() {
        return parsed.to_string();
    }
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "api_key" {
                "REDACTED".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

/// Plain GET + JSON decode with outcome classification.
#[derive(Clone)]
pub struct JsonFetcher {
    http: Client,
}

impl fmt::Debug for JsonFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonFetcher").finish_non_exhaustive()
    }
}

impl JsonFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        interpret: ErrorInterpreter,
    ) -> Result<T, FetchError> {
        let target = redact_url(url);
        debug!(url = %target, "GET");

        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                target: target.clone(),
                message: e.to_string(),
            })?;

        let status = res.status();
        let body = res.text().await.map_err(|e| FetchError::Transport {
            target: target.clone(),
            message: format!("failed to read body: {}", e),
        })?;

        if !status.is_success() {
            let failure = interpret(status, &body);
            warn!(
                url = %target,
                %status,
                message = %failure.message,
                permanent = failure.permanent,
                "provider error"
            );
            return Err(FetchError::Provider {
                target,
                status: status.as_u16(),
                message: failure.message,
                permanent: failure.permanent,
            });
        }

        decode_body(&target, &body)
    }
}

/// Decode a success body; any mismatch is a schema violation.
pub fn decode_body<T: DeserializeOwned>(target: &str, body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|e| FetchError::SchemaViolation {
        target: target.to_string(),
        message: e.to_string(),
    })
}
