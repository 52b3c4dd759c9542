use std::fmt;

use reqwest::{
    header::{HeaderMap, HeaderValue},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;

use crate::{Result, SlingClientError};

/// Method and absolute URL of a logical request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: Method,
    pub url: String,
}

impl RequestSummary {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }

    /// Path component of the URL, or the whole URL when it cannot be parsed.
    pub fn path(&self) -> &str {
        self.url
            .find("://")
            .and_then(|scheme_end| {
                let rest = &self.url[scheme_end + 3..];
                rest.find('/').map(|idx| &rest[idx..])
            })
            .unwrap_or(&self.url)
    }
}

impl fmt::Display for RequestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Fully drained response of the final physical attempt.
#[derive(Clone, Debug)]
pub struct SlingResponse {
    request: RequestSummary,
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl SlingResponse {
    pub fn new(request: RequestSummary, status: StatusCode, headers: HeaderMap, body: String) -> Self {
        Self {
            request,
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn header_values(&self, name: &str) -> impl Iterator<Item = &HeaderValue> {
        self.headers.get_all(name).iter()
    }

    pub fn content(&self) -> &str {
        &self.body
    }

    pub fn into_content(self) -> String {
        self.body
    }

    pub fn request(&self) -> &RequestSummary {
        &self.request
    }

    /// Path of the node affected by a Sling POST, from the HTML status page.
    pub fn sling_path(&self) -> Option<&str> {
        self.status_div("Path")
    }

    pub fn sling_location(&self) -> Option<&str> {
        self.status_div("Location")
    }

    pub fn sling_message(&self) -> Option<&str> {
        self.status_div("Message")
    }

    fn status_div(&self, id: &str) -> Option<&str> {
        let marker = format!("<div id=\"{id}\">");
        let start = self.body.find(&marker)? + marker.len();
        let end = self.body[start..].find("</div>")?;
        Some(self.body[start..start + end].trim())
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|err| {
            SlingClientError::Decode(format!(
                "invalid JSON from {}: {err}; body: {}",
                self.request,
                crate::error::excerpt(&self.body, 256)
            ))
        })
    }
}
