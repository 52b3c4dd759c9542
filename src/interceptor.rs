//! Request/response hooks that run on every physical attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header::HeaderMap, Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::{RequestSummary, Session};

/// Last path segment of the form-login endpoint.
pub const FORM_LOGIN_PATH: &str = "j_security_check";

/// Mutable view of a physical request before it is sent.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

/// Status and headers of a physical response, before retry evaluation.
#[derive(Debug)]
pub struct ResponseHead<'a> {
    pub request: &'a RequestSummary,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
}

/// Caller-supplied synchronous hook.
pub trait RequestInterceptor: Send + Sync {
    fn before_request(&self, _request: &mut OutgoingRequest, _session: &Session) {}

    fn after_response(&self, _response: &ResponseHead<'_>, _session: &Session) {}
}

/// Hooks installed on a client, applied in order.
#[derive(Clone)]
pub enum Interceptor {
    /// Log in through `j_security_check` and keep the session cookie.
    FormLogin(FormLogin),
    /// Fixed pause before every physical attempt.
    Delay(Duration),
    Custom(Arc<dyn RequestInterceptor>),
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FormLogin(login) => f.debug_tuple("FormLogin").field(login).finish(),
            Self::Delay(delay) => f.debug_tuple("Delay").field(delay).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Form-based login keyed on a session cookie name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormLogin {
    cookie_name: String,
}

impl FormLogin {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn is_login_request(path: &str) -> bool {
        path.ends_with(FORM_LOGIN_PATH)
    }

    /// Whether a login sub-request must precede a request to `path`.
    pub fn needs_login(&self, path: &str, session: &Session) -> bool {
        if Self::is_login_request(path) {
            debug!(path, "request targets the login endpoint, not intercepting");
            return false;
        }
        if session.credentials().is_none() {
            return false;
        }
        match session.cookies().get(&self.cookie_name) {
            Some(cookie) if !cookie.value.is_empty() => {
                debug!(cookie = %cookie.name, "session cookie present, not intercepting");
                false
            }
            _ => true,
        }
    }

    /// Login endpoint resolved against the request URL.
    pub fn login_url(&self, request_url: &Url) -> Result<Url, url::ParseError> {
        request_url.join(FORM_LOGIN_PATH)
    }

    /// Expires the session cookie when a non-login request comes back 401.
    pub fn on_response(&self, response: &ResponseHead<'_>, session: &Session) {
        if response.status != StatusCode::UNAUTHORIZED
            || Self::is_login_request(response.request.path())
        {
            return;
        }
        if session.cookies().expire(&self.cookie_name) {
            debug!(cookie = %self.cookie_name, "401 received, session cookie invalidated");
        }
    }
}
