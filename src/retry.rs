//! Retry decisions for completed HTTP responses.
//!
//! The policy is a pure function of the status code, the execution count,
//! the caller's expected statuses and the client's [`RetryConfig`].
//! Connection-level failures never reach it; the executor retries those
//! against the same budget without a status code.

use std::time::Duration;

use reqwest::{header::HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::{error::excerpt, RequestSummary, RetryConfig};

const LOGGED_BODY_LIMIT: usize = 2_048;

/// Which completed responses are worth another attempt.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetryStrategy {
    /// Retry codes from `retryable_status_codes`, or any 5xx when that set is empty.
    #[default]
    ServerError,
    /// Retry only `503 Service Unavailable`.
    ServiceUnavailable,
    /// Never retry a completed response.
    Disabled,
}

/// Diagnostic view of a response the policy has just judged.
#[derive(Debug)]
pub struct RetryContext<'a> {
    pub request: &'a RequestSummary,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
}

impl RetryStrategy {
    /// Decides whether attempt number `execution_count` (1-based) should be
    /// followed by another one.
    pub fn should_retry(
        &self,
        status: u16,
        execution_count: usize,
        expected: &[u16],
        config: &RetryConfig,
    ) -> bool {
        if execution_count > config.max_retries {
            return false;
        }
        if expected.contains(&status) {
            return false;
        }
        match self {
            Self::ServerError => {
                if config.retryable_status_codes.is_empty() {
                    (500..600).contains(&status)
                } else {
                    config.retryable_status_codes.contains(&status)
                }
            }
            Self::ServiceUnavailable => status == StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            Self::Disabled => false,
        }
    }

    /// Fixed pause before the next attempt.
    pub fn retry_delay(&self, config: &RetryConfig) -> Duration {
        config.retry_interval()
    }

    /// Same decision as [`RetryStrategy::should_retry`], plus the retry
    /// diagnostics when `log_retries` is on.
    pub(crate) fn judge(
        &self,
        ctx: &RetryContext<'_>,
        execution_count: usize,
        expected: &[u16],
        config: &RetryConfig,
    ) -> bool {
        let status = ctx.status.as_u16();
        let retry = self.should_retry(status, execution_count, expected, config);
        if retry {
            debug!(
                request = %ctx.request,
                status,
                attempt = execution_count,
                max_retries = config.max_retries,
                "response is retryable"
            );
            if config.log_retries {
                self.log_retry(ctx, execution_count, expected, config);
            }
        }
        retry
    }

    fn log_retry(
        &self,
        ctx: &RetryContext<'_>,
        execution_count: usize,
        expected: &[u16],
        config: &RetryConfig,
    ) {
        warn!(
            "Request retry condition met: [count={}/{}], [expected-codes={:?}], [retry-codes={:?}], [strategy={:?}]",
            execution_count, config.max_retries, expected, config.retryable_status_codes, self
        );
        warn!("Request: {} {}", ctx.request.method, ctx.request.path());
        warn!(
            "Response: {} [{}]",
            status_line(ctx.status),
            format_headers(ctx.headers)
        );
        warn!("Response Body: {}", excerpt(ctx.body, LOGGED_BODY_LIMIT));
    }
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}

fn format_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {}", value.to_str().unwrap_or("<binary>")))
        .collect::<Vec<_>>()
        .join(", ")
}
