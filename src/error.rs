use std::time::Duration;

use reqwest::StatusCode;

use crate::{RequestSummary, SlingResponse};

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum SlingClientError {
    /// Connection-level failure (timeout, refused, reset, DNS) after the
    /// retry budget was spent.
    #[error("transport error on {request} after {attempts} attempt(s): {source}")]
    Transport {
        request: RequestSummary,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    /// Final response status was not one the caller expected.
    #[error("{}", unexpected_status_message(expected, *actual, request, response))]
    UnexpectedStatus {
        expected: Vec<u16>,
        actual: u16,
        request: RequestSummary,
        response: Box<SlingResponse>,
    },
    /// A polling probe never converged within its timeout.
    #[error("{message}")]
    PollTimeout {
        message: String,
        timeout: Duration,
        delay: Duration,
        elapsed: Duration,
        last_error: Option<String>,
    },
    /// Caller-side misconfiguration. Never retried.
    #[error("setup error: {0}")]
    Setup(String),
    /// The form-login sub-request failed.
    #[error("authentication failed: {0}")]
    Authentication(Box<SlingClientError>),
    /// A retry or poll sleep was interrupted through a cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// Response body did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

impl SlingClientError {
    /// HTTP status of the last response, when one was received.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { actual, .. } => Some(*actual),
            Self::Transport { source, .. } => source.status().map(|status| status.as_u16()),
            Self::Authentication(inner) => inner.http_status(),
            _ => None,
        }
    }

    /// Last response received before the error was raised.
    pub fn response(&self) -> Option<&SlingResponse> {
        match self {
            Self::UnexpectedStatus { response, .. } => Some(response),
            Self::Authentication(inner) => inner.response(),
            _ => None,
        }
    }

    /// Request that produced the error.
    pub fn request(&self) -> Option<&RequestSummary> {
        match self {
            Self::Transport { request, .. } | Self::UnexpectedStatus { request, .. } => {
                Some(request)
            }
            Self::Authentication(inner) => inner.request(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PollTimeout { .. })
    }

    /// Also true for a login sub-request that failed in transport.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Authentication(inner) => inner.is_transport(),
            _ => false,
        }
    }

    pub fn is_unexpected_status(&self) -> bool {
        match self {
            Self::UnexpectedStatus { .. } => true,
            Self::Authentication(inner) => inner.is_unexpected_status(),
            _ => false,
        }
    }
}

pub(crate) const EXPECTED_STATUS_PREFIX: &str = "Expected HTTP Status: ";

const CONTENT_EXCERPT_LIMIT: usize = 512;

fn unexpected_status_message(
    expected: &[u16],
    actual: u16,
    request: &RequestSummary,
    response: &SlingResponse,
) -> String {
    let expected = expected
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let reason = StatusCode::from_u16(actual)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("");
    format!(
        "{EXPECTED_STATUS_PREFIX}{expected} . Instead {actual} was returned!\nRequest: {request}\nResponse: {actual} {reason}\n{}",
        excerpt(response.content(), CONTENT_EXCERPT_LIMIT)
    )
}

/// Truncates `text` to at most `limit` bytes on a char boundary.
pub(crate) fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &text[..end], text.len())
}

#[cfg(test)]
mod tests {
    use reqwest::{header::HeaderMap, Method, StatusCode};

    use super::{excerpt, SlingClientError};
    use crate::{RequestSummary, SlingResponse};

    fn unavailable() -> SlingClientError {
        let request = RequestSummary::new(Method::GET, "http://localhost:8080/test/unavailable");
        SlingClientError::UnexpectedStatus {
            expected: vec![200],
            actual: 503,
            request: request.clone(),
            response: Box::new(SlingResponse::new(
                request,
                StatusCode::SERVICE_UNAVAILABLE,
                HeaderMap::new(),
                "TEST_NOK".to_owned(),
            )),
        }
    }

    #[test]
    fn unexpected_status_message_is_matchable() {
        let message = unavailable().to_string();
        assert!(message.starts_with("Expected HTTP Status: 200 . Instead 503 was returned!"));
        assert!(message.contains("GET http://localhost:8080/test/unavailable"));
        assert!(message.contains("TEST_NOK"));
    }

    #[test]
    fn accessors_expose_status_request_and_response() {
        let err = unavailable();
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(err.response().map(SlingResponse::content), Some("TEST_NOK"));
        assert!(err.is_unexpected_status());

        let wrapped = SlingClientError::Authentication(Box::new(err));
        assert_eq!(wrapped.http_status(), Some(503));
        assert!(wrapped.request().is_some());
        assert!(wrapped.is_unexpected_status());
        assert!(!wrapped.is_transport());
        assert!(wrapped.to_string().starts_with("authentication failed: Expected HTTP Status"));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("short", 10), "short");
        let text = "ééééé";
        let cut = excerpt(text, 3);
        assert!(cut.starts_with('é'));
        assert!(cut.ends_with("(10 bytes total)"));
    }
}
