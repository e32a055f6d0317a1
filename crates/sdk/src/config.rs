//! Client settings.

use crate::error::ShoalError;
use std::time::Duration;
use url::Url;

/// Settings shared by every request a [`crate::ShoalClient`] sends.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the agent.
    pub base_url: Url,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy for reads.
    pub retry_config: RetryConfig,
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            token: None,
            timeout: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
        }
    }
}

/// How the transport retries reads that failed transiently.
///
/// Only GET requests are retried. Submissions, operator commands and task
/// dispatches go out exactly once, because an agent must never see the same
/// RETRY or CANCEL twice. A [`crate::DagHandler`] turns this off and applies
/// its own fetch budget instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether a read that failed with `error` after `attempt` retries goes out again.
    pub fn permits(&self, attempt: u32, error: &ShoalError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }
}
