use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method,
};

use crate::{Result, SlingClientError};

/// Body of a logical request, encoded once and replayed on every attempt.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Text {
        content: String,
        content_type: String,
    },
    /// `application/x-www-form-urlencoded` pairs; repeated names are kept.
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    /// `multipart/form-data`; rebuilt for every attempt.
    Multipart(Vec<MultipartField>),
}

/// One part of a `multipart/form-data` body.
#[derive(Clone, Debug, PartialEq)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Text {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self::File {
            name: name.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Builds a fresh form; `reqwest` consumes it on send.
pub(crate) fn multipart_form(
    fields: &[MultipartField],
) -> std::result::Result<reqwest::multipart::Form, reqwest::Error> {
    let mut form = reqwest::multipart::Form::new();
    for field in fields {
        form = match field {
            MultipartField::Text { name, value } => form.text(name.clone(), value.clone()),
            MultipartField::File {
                name,
                file_name,
                content_type,
                bytes,
            } => {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(content_type)?;
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}

impl RequestBody {
    /// Content type and bytes for replayable bodies. Multipart bodies carry
    /// their own boundary and are sent through [`multipart_form`] instead.
    pub(crate) fn encode(&self) -> Result<Option<(HeaderValue, Vec<u8>)>> {
        let encoded = match self {
            Self::Empty | Self::Multipart(_) => return Ok(None),
            Self::Text {
                content,
                content_type,
            } => (
                HeaderValue::from_str(content_type).map_err(|err| {
                    SlingClientError::Setup(format!("invalid content type '{content_type}': {err}"))
                })?,
                content.as_bytes().to_vec(),
            ),
            Self::Form(pairs) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                (
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                    encoded.into_bytes(),
                )
            }
            Self::Json(value) => (
                HeaderValue::from_static("application/json"),
                serde_json::to_vec(value).map_err(|err| {
                    SlingClientError::Setup(format!("cannot serialize JSON body: {err}"))
                })?,
            ),
        };
        Ok(Some(encoded))
    }
}

/// One logical request: what to send and which statuses count as success.
#[derive(Clone, Debug)]
pub struct SlingRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestBody,
    pub(crate) expected: Vec<u16>,
    pub(crate) user_agent: Option<String>,
}

impl SlingRequest {
    /// `path` is either relative to the client base URL or absolute.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            expected: Vec::new(),
            user_agent: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Statuses that end the call successfully and are never retried.
    /// Leaving this empty returns whatever final status the server sent.
    pub fn expect<I>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.expected = statuses.into_iter().collect();
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Form(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn text(mut self, content: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Text {
            content: content.into(),
            content_type: content_type.into(),
        };
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn multipart(mut self, fields: impl IntoIterator<Item = MultipartField>) -> Self {
        self.body = RequestBody::Multipart(fields.into_iter().collect());
        self
    }

    /// User agent for this request only; blank values are ignored.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn expected(&self) -> &[u16] {
        &self.expected
    }

    pub(crate) fn content_type_set(&self) -> bool {
        self.headers.contains_key(CONTENT_TYPE)
    }
}
