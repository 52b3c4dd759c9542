use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    executor::RequestExecutor,
    interceptor::{FormLogin, Interceptor},
    options::{ENV_PASSWORD, ENV_URL, ENV_USER},
    ClientOptions, Cookie, CookieStore, Credentials, Poller, Result, Session, SlingClientError,
    SlingRequest, SlingResponse,
};

/// HTTP client for a Sling instance under test.
///
/// Cloning is cheap; clones share the cookie store, session and connection
/// pool.
#[derive(Clone)]
pub struct SlingClient {
    executor: Arc<RequestExecutor>,
    extensions: Arc<BTreeMap<String, String>>,
}

impl fmt::Debug for SlingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlingClient")
            .field("url", &self.executor.base_url().as_str())
            .field("user", &self.user())
            .field("password", &"<redacted>")
            .field("options", self.executor.options())
            .finish()
    }
}

/// Builder for [`SlingClient`].
#[derive(Debug)]
pub struct SlingClientBuilder {
    url: String,
    user: Option<String>,
    password: Option<String>,
    options: ClientOptions,
    preemptive_auth: bool,
    interceptors: Vec<Interceptor>,
    cookie_store: Option<Arc<CookieStore>>,
    extensions: BTreeMap<String, String>,
    cancel: Option<CancellationToken>,
}

impl SlingClientBuilder {
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Send basic-auth credentials with every request. On by default.
    pub fn preemptive_auth(mut self, enabled: bool) -> Self {
        self.preemptive_auth = enabled;
        self
    }

    /// Appends an interceptor; interceptors run in insertion order.
    pub fn interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Shares an existing cookie store instead of creating a fresh one.
    pub fn cookie_store(mut self, store: Arc<CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Token that interrupts retry and poll sleeps with
    /// [`SlingClientError::Cancelled`].
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn try_build(self) -> Result<SlingClient> {
        let base_url = normalize_base_url(&self.url)?;
        let credentials = self.user.map(|user| Credentials {
            user,
            password: self.password.unwrap_or_default(),
        });

        let mut interceptors = self.interceptors;
        if let Some(cookie_name) = &self.options.login_token_cookie {
            let installed = interceptors
                .iter()
                .any(|interceptor| matches!(interceptor, Interceptor::FormLogin(_)));
            if !installed {
                interceptors.insert(0, Interceptor::FormLogin(FormLogin::new(cookie_name)));
            }
        }

        let session = Arc::new(Session::new(
            self.cookie_store.unwrap_or_default(),
            credentials,
            self.preemptive_auth,
        ));
        let mut executor = RequestExecutor::new(base_url, self.options, session, interceptors)?;
        if let Some(token) = self.cancel {
            executor = executor.with_cancellation(token);
        }
        debug!(url = %executor.base_url(), "sling client ready");
        Ok(SlingClient {
            executor: Arc::new(executor),
            extensions: Arc::new(self.extensions),
        })
    }
}

/// Parses `raw` as an absolute http(s) URL with a host, ending in `/`.
fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|err| SlingClientError::Setup(format!("invalid server URL '{raw}': {err}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(SlingClientError::Setup(format!(
            "server URL '{raw}' must be an absolute http(s) URL with a host"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl SlingClient {
    pub fn builder(url: impl Into<String>) -> SlingClientBuilder {
        SlingClientBuilder {
            url: url.into(),
            user: None,
            password: None,
            options: ClientOptions::default(),
            preemptive_auth: true,
            interceptors: Vec::new(),
            cookie_store: None,
            extensions: BTreeMap::new(),
            cancel: None,
        }
    }

    /// Client authenticating as `user` with default options.
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::builder(url).user(user).password(password).try_build()
    }

    /// Creates a client from environment variables.
    ///
    /// Reads `SLING_IT_URL` (required), `SLING_IT_USER` and
    /// `SLING_IT_PASSWORD`, plus the `SLING_IT_HTTP_*` option overrides.
    pub fn from_env() -> Result<Self> {
        Self::builder_from_lookup(|key| std::env::var(key).ok())?.try_build()
    }

    pub(crate) fn builder_from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<SlingClientBuilder> {
        let url = lookup(ENV_URL)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| SlingClientError::Setup(format!("{ENV_URL} is missing or empty")))?;
        let mut builder = Self::builder(url).options(ClientOptions::from_lookup(&lookup));
        if let Some(user) = lookup(ENV_USER).filter(|user| !user.trim().is_empty()) {
            builder = builder.user(user);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            builder = builder.password(password);
        }
        Ok(builder)
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn base_url(&self) -> &Url {
        self.executor.base_url()
    }

    pub fn options(&self) -> &ClientOptions {
        self.executor.options()
    }

    /// Effective user; reflects impersonation.
    pub fn user(&self) -> Option<String> {
        self.executor.session().user()
    }

    pub fn password(&self) -> Option<&str> {
        self.executor
            .session()
            .credentials()
            .map(|credentials| credentials.password.as_str())
    }

    pub fn cookie_store(&self) -> &CookieStore {
        self.executor.session().cookies()
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    /// Absolute URL for `path`, kept under the base URL's context path.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.executor.url(path)
    }

    /// Poller scaled by the configured timeout multiplier and bound to the
    /// client's cancellation token.
    pub fn poller(&self, timeout: Duration, delay: Duration) -> Poller {
        let poller =
            Poller::new(timeout, delay).multiplier(self.executor.options().timeout_multiplier);
        match self.executor.cancellation() {
            Some(token) => poller.cancel_on(token.clone()),
            None => poller,
        }
    }

    pub async fn execute(&self, request: SlingRequest) -> Result<SlingResponse> {
        self.executor.execute(&request).await
    }

    pub async fn get<I>(&self, path: &str, expected: I) -> Result<SlingResponse>
    where
        I: IntoIterator<Item = u16>,
    {
        self.execute(SlingRequest::get(path).expect(expected)).await
    }

    pub async fn head<I>(&self, path: &str, expected: I) -> Result<SlingResponse>
    where
        I: IntoIterator<Item = u16>,
    {
        self.execute(SlingRequest::new(Method::HEAD, path).expect(expected))
            .await
    }

    pub async fn delete<I>(&self, path: &str, expected: I) -> Result<SlingResponse>
    where
        I: IntoIterator<Item = u16>,
    {
        self.execute(SlingRequest::delete(path).expect(expected))
            .await
    }

    pub async fn post_form<P, K, V, I>(
        &self,
        path: &str,
        pairs: P,
        expected: I,
    ) -> Result<SlingResponse>
    where
        P: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = u16>,
    {
        self.execute(SlingRequest::post(path).form(pairs).expect(expected))
            .await
    }

    pub async fn post_text<I>(
        &self,
        path: &str,
        content: &str,
        content_type: &str,
        expected: I,
    ) -> Result<SlingResponse>
    where
        I: IntoIterator<Item = u16>,
    {
        self.execute(
            SlingRequest::post(path)
                .text(content, content_type)
                .expect(expected),
        )
        .await
    }

    /// Whether `<path>.json` answers 200.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let response = self
            .execute(SlingRequest::get(format!("{}.json", path.trim_end_matches('/'))))
            .await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Acts as `user` on subsequent requests through the sudo cookie.
    /// `None` ends the impersonation.
    pub fn impersonate(&self, user: Option<&str>) {
        let Some(user) = user else {
            self.end_impersonation();
            return;
        };
        let session = self.executor.session();
        session
            .cookies()
            .add(Cookie::new(&self.executor.options().sudo_cookie_name, user));
        session.set_impersonated(Some(user.to_owned()));
        debug!(user, "impersonation started");
    }

    pub fn end_impersonation(&self) {
        let session = self.executor.session();
        session
            .cookies()
            .remove(&self.executor.options().sudo_cookie_name);
        session.set_impersonated(None);
    }

    /// Creates a node through the Sling POST servlet.
    pub async fn create_node(&self, path: &str, primary_type: &str) -> Result<SlingResponse> {
        self.post_form(
            path,
            [("jcr:primaryType", primary_type), ("_charset_", "utf-8")],
            [200, 201],
        )
        .await
    }

    /// Creates every missing ancestor of `path`, then `path` itself.
    pub async fn create_node_recursive(&self, path: &str, primary_type: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !self.exists(&current).await? {
                self.create_node(&current, primary_type).await?;
            }
        }
        Ok(())
    }

    /// Imports serialized content below `path` (`:operation=import`).
    pub async fn import_content(
        &self,
        path: &str,
        content_type: &str,
        content: &str,
    ) -> Result<SlingResponse> {
        self.post_form(
            path,
            [
                (":operation", "import"),
                (":contentType", content_type),
                (":content", content),
                ("_charset_", "utf-8"),
            ],
            [201],
        )
        .await
    }

    pub async fn import_json(&self, path: &str, content: &serde_json::Value) -> Result<SlingResponse> {
        self.import_content(path, "json", &content.to_string()).await
    }

    pub async fn set_property_string(
        &self,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<SlingResponse> {
        self.post_form(path, [(name, value), ("_charset_", "utf-8")], [200])
            .await
    }

    /// Deletes `path` through the Sling POST servlet (`:operation=delete`).
    pub async fn delete_path(&self, path: &str) -> Result<SlingResponse> {
        self.post_form(path, [(":operation", "delete")], [200]).await
    }
}
