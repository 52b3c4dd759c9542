//! Retrying HTTP transport: one logical request, many physical attempts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT},
    StatusCode,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    interceptor::{FormLogin, Interceptor, OutgoingRequest, ResponseHead},
    request::{multipart_form, RequestBody},
    retry::RetryContext,
    user_agent, ClientOptions, RequestSummary, Result, Session, SlingClientError, SlingRequest,
    SlingResponse,
};

/// Sends [`SlingRequest`]s through `reqwest`, consulting the client's
/// [`RetryStrategy`](crate::RetryStrategy) after every completed response.
pub struct RequestExecutor {
    http: reqwest::Client,
    base_url: Url,
    options: ClientOptions,
    session: Arc<Session>,
    interceptors: Vec<Interceptor>,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url.as_str())
            .field("options", &self.options)
            .field("interceptors", &self.interceptors)
            .finish()
    }
}

/// Outcome of one physical attempt that produced a response.
struct Attempt {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

/// Boxed login future; erases the type so the login sub-request may reuse
/// the retry loop it is called from.
type LoginFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

impl RequestExecutor {
    pub(crate) fn new(
        base_url: Url,
        options: ClientOptions,
        session: Arc<Session>,
        interceptors: Vec<Interceptor>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| SlingClientError::Setup(format!("cannot build HTTP client: {err}")))?;
        Ok(Self {
            http,
            base_url,
            options,
            session,
            interceptors,
            cancel: None,
        })
    }

    pub(crate) fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Resolves `path` against the base URL. Absolute `http`/`https` URLs
    /// pass through; everything else, including `/jcr:system`-style paths,
    /// stays under the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(url);
            }
        }
        // "./" keeps a colon in the first segment from reading as a scheme.
        self.base_url
            .join(&format!("./{}", path.trim_start_matches('/')))
            .map_err(|err| SlingClientError::Setup(format!("invalid path '{path}': {err}")))
    }

    /// Executes one logical request to completion.
    pub async fn execute(&self, request: &SlingRequest) -> Result<SlingResponse> {
        self.run(request, true).await
    }

    async fn run(&self, request: &SlingRequest, login: bool) -> Result<SlingResponse> {
        let mut url = self.url(&request.path)?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        let summary = RequestSummary::new(request.method.clone(), url.as_str());
        let body = request.body.encode()?;
        let retry = &self.options.retry;
        let strategy = self.options.retry_strategy;

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            self.before_attempt(&url, login).await?;

            let outcome = self
                .interruptible(self.send_once(request, &url, &summary, body.as_ref()))
                .await?;
            match outcome {
                Ok(done) => {
                    let ctx = RetryContext {
                        request: &summary,
                        status: done.status,
                        headers: &done.headers,
                        body: &done.body,
                    };
                    if strategy.judge(&ctx, attempt, &request.expected, retry) {
                        self.pause(strategy.retry_delay(retry)).await?;
                        continue;
                    }
                    return finalize(request, summary, done);
                }
                Err(err) => {
                    if attempt <= retry.max_retries {
                        debug!(
                            request = %summary,
                            attempt,
                            max_retries = retry.max_retries,
                            error = %err,
                            "transport error, retrying"
                        );
                        if retry.log_retries {
                            warn!("Request {summary} failed at transport level: {err}");
                        }
                        self.pause(strategy.retry_delay(retry)).await?;
                        continue;
                    }
                    return Err(SlingClientError::Transport {
                        request: summary,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn before_attempt(&self, url: &Url, login: bool) -> Result<()> {
        for interceptor in &self.interceptors {
            if let Interceptor::Delay(delay) = interceptor {
                self.pause(*delay).await?;
            }
        }
        if self.options.request_delay_ms > 0 {
            self.pause(Duration::from_millis(self.options.request_delay_ms))
                .await?;
        }
        if login {
            for interceptor in &self.interceptors {
                if let Interceptor::FormLogin(form) = interceptor {
                    self.form_login(form, url).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_once(
        &self,
        request: &SlingRequest,
        url: &Url,
        summary: &RequestSummary,
        body: Option<&(HeaderValue, Vec<u8>)>,
    ) -> std::result::Result<Attempt, reqwest::Error> {
        let mut outgoing = OutgoingRequest {
            method: request.method.clone(),
            url: url.clone(),
            headers: request.headers.clone(),
        };
        self.decorate(&mut outgoing, request, body);

        let mut builder = self
            .http
            .request(outgoing.method, outgoing.url)
            .headers(outgoing.headers)
            .timeout(self.options.timeout());
        if let Some(credentials) = self
            .session
            .credentials()
            .filter(|_| self.session.preemptive_auth())
        {
            builder = builder.basic_auth(&credentials.user, Some(&credentials.password));
        }
        if let Some((_, bytes)) = body {
            builder = builder.body(bytes.clone());
        } else if let RequestBody::Multipart(fields) = &request.body {
            builder = builder.multipart(multipart_form(fields)?);
        }

        let response = builder.send().await?;
        self.session.cookies().capture(&response);
        let status = response.status();
        let headers = response.headers().clone();
        self.after_response(&ResponseHead {
            request: summary,
            status,
            headers: &headers,
        });
        let body = response.text().await?;
        Ok(Attempt {
            status,
            headers,
            body,
        })
    }

    fn decorate(
        &self,
        outgoing: &mut OutgoingRequest,
        request: &SlingRequest,
        body: Option<&(HeaderValue, Vec<u8>)>,
    ) {
        let agent = user_agent::resolve(
            request.user_agent.as_deref(),
            self.options.user_agent.as_deref(),
        );
        if let Ok(agent) = HeaderValue::from_str(&agent) {
            outgoing.headers.insert(USER_AGENT, agent);
        }
        if let Some((content_type, _)) = body {
            if !request.content_type_set() {
                outgoing.headers.insert(CONTENT_TYPE, content_type.clone());
            }
        }
        if let Some(cookies) = self.session.cookies().header_for(outgoing.url.path()) {
            if let Ok(value) = HeaderValue::from_str(&cookies) {
                outgoing.headers.insert(COOKIE, value);
            }
        }
        for interceptor in &self.interceptors {
            if let Interceptor::Custom(hook) = interceptor {
                hook.before_request(outgoing, &self.session);
            }
        }
    }

    fn after_response(&self, head: &ResponseHead<'_>) {
        for interceptor in &self.interceptors {
            match interceptor {
                Interceptor::FormLogin(login) => login.on_response(head, &self.session),
                Interceptor::Custom(hook) => hook.after_response(head, &self.session),
                Interceptor::Delay(_) => {}
            }
        }
    }

    /// Posts the session credentials to `j_security_check` when the
    /// session cookie is missing. The sub-request skips login itself.
    fn form_login<'a>(&'a self, login: &'a FormLogin, url: &'a Url) -> LoginFuture<'a> {
        Box::pin(async move {
            if !login.needs_login(url.path(), &self.session) {
                return Ok(());
            }
            let Some(credentials) = self.session.credentials() else {
                return Ok(());
            };
            let login_url = login.login_url(url).map_err(|err| {
                SlingClientError::Setup(format!("cannot resolve login URL: {err}"))
            })?;
            debug!(url = %login_url, user = %credentials.user, "performing form login");

            let request = SlingRequest::post(login_url.as_str())
                .form([
                    ("j_username", credentials.user.as_str()),
                    ("j_password", credentials.password.as_str()),
                    ("_charset_", "utf-8"),
                ])
                .expect(LOGIN_ACCEPTED);
            self.run(&request, false)
                .await
                .map(|_| ())
                .map_err(|err| SlingClientError::Authentication(Box::new(err)))
        })
    }

    /// Sleeps for `delay` unless the client's cancellation token fires first.
    pub(crate) async fn pause(&self, delay: Duration) -> Result<()> {
        self.interruptible(sleep(delay)).await
    }

    async fn interruptible<F: Future>(&self, future: F) -> Result<F::Output> {
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(SlingClientError::Cancelled),
                output = future => Ok(output),
            },
            None => Ok(future.await),
        }
    }
}

/// Statuses accepted from `j_security_check`.
const LOGIN_ACCEPTED: [u16; 5] = [200, 204, 302, 303, 307];

fn finalize(request: &SlingRequest, summary: RequestSummary, done: Attempt) -> Result<SlingResponse> {
    let status = done.status.as_u16();
    let response = SlingResponse::new(summary.clone(), done.status, done.headers, done.body);
    if request.expected.is_empty() || request.expected.contains(&status) {
        return Ok(response);
    }
    Err(SlingClientError::UnexpectedStatus {
        expected: request.expected.clone(),
        actual: status,
        request: summary,
        response: Box::new(response),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::{header::HeaderMap, Method, StatusCode};
    use url::Url;

    use super::{finalize, Attempt, RequestExecutor};
    use crate::{
        ClientOptions, CookieStore, RequestSummary, Session, SlingClientError, SlingRequest,
    };

    fn executor() -> RequestExecutor {
        RequestExecutor::new(
            Url::parse("http://localhost:8080/ctx/").expect("valid url"),
            ClientOptions::default(),
            Arc::new(Session::new(Arc::new(CookieStore::new()), None, true)),
            Vec::new(),
        )
        .expect("client builds")
    }

    fn attempt(status: StatusCode) -> Attempt {
        Attempt {
            status,
            headers: HeaderMap::new(),
            body: "body".to_owned(),
        }
    }

    #[test]
    fn relative_paths_stay_under_context_path() {
        let executor = executor();
        assert_eq!(
            executor.url("/content/a.json").expect("joins").as_str(),
            "http://localhost:8080/ctx/content/a.json"
        );
        assert_eq!(
            executor.url("http://other:1/x").expect("absolute").as_str(),
            "http://other:1/x"
        );
    }

    #[test]
    fn namespaced_first_segment_is_not_a_scheme() {
        let executor = executor();
        assert_eq!(
            executor.url("/oak:index/uuid.json").expect("joins").as_str(),
            "http://localhost:8080/ctx/oak:index/uuid.json"
        );
        assert_eq!(
            executor.url("jcr:system/x").expect("joins").as_str(),
            "http://localhost:8080/ctx/jcr:system/x"
        );
        assert_eq!(
            executor.url("/var:x").expect("joins").as_str(),
            "http://localhost:8080/ctx/var:x"
        );
    }

    #[test]
    fn finalize_checks_expected_statuses() {
        let summary = RequestSummary::new(Method::GET, "http://h/x");
        let request = SlingRequest::get("/x").expect([200]);
        assert!(finalize(&request, summary.clone(), attempt(StatusCode::OK)).is_ok());

        let err = finalize(&request, summary.clone(), attempt(StatusCode::NOT_FOUND))
            .expect_err("404 is not expected");
        assert!(matches!(err, SlingClientError::UnexpectedStatus { actual: 404, .. }));

        let any = SlingRequest::get("/x");
        let response = finalize(&any, summary, attempt(StatusCode::BAD_GATEWAY))
            .expect("no expectations accepts anything");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn pause_is_interrupted_by_cancellation() {
        let token = tokio_util::sync::CancellationToken::new();
        let executor = executor().with_cancellation(token.clone());
        token.cancel();
        let err = executor
            .pause(std::time::Duration::from_secs(30))
            .await
            .expect_err("cancelled sleep must fail");
        assert!(matches!(err, SlingClientError::Cancelled));
    }
}
