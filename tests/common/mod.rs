#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tracing_subscriber::EnvFilter;

/// One request as seen by the mock server.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn form_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

#[derive(Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, String)>,
    body: String,
    delay: Duration,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("valid mock status"),
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::from_millis(0),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::new(status, body.to_string()).with_header(
            axum::http::header::CONTENT_TYPE,
            "application/json",
        )
    }

    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Route = Arc<dyn Fn(&Recorded, usize) -> MockResponse + Send + Sync>;

#[derive(Clone)]
struct ServerState {
    requests: Arc<Mutex<Vec<Recorded>>>,
    route: Route,
}

async fn dispatch(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let recorded = Recorded {
        method,
        path: uri.path().to_owned(),
        query: uri.query().unwrap_or_default().to_owned(),
        headers,
        body,
    };
    let hit = {
        let mut requests = state
            .requests
            .lock()
            .expect("request log mutex must not be poisoned");
        requests.push(recorded.clone());
        requests
            .iter()
            .filter(|request| request.path == recorded.path)
            .count()
    };

    let mock = (state.route)(&recorded, hit);
    if !mock.delay.is_zero() {
        tokio::time::sleep(mock.delay).await;
    }

    let mut response = (mock.status, mock.body).into_response();
    for (name, value) in mock.headers {
        response.headers_mut().append(
            name,
            HeaderValue::from_str(&value).expect("valid mock header value"),
        );
    }
    response
}

pub struct TestServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests
            .lock()
            .expect("request log mutex must not be poisoned")
            .clone()
    }

    /// Requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn last(&self, path: &str) -> Recorded {
        self.requests()
            .into_iter()
            .rev()
            .find(|request| request.path == path)
            .expect("path must have been requested")
    }
}

/// Routes client logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Starts a mock server answering every request through `route`, which
/// also receives the 1-based hit count of the requested path.
pub async fn spawn_server<F>(route: F) -> TestServer
where
    F: Fn(&Recorded, usize) -> MockResponse + Send + Sync + 'static,
{
    init_tracing();
    let state = ServerState {
        requests: Arc::new(Mutex::new(Vec::new())),
        route: Arc::new(route),
    };
    let app = Router::new().fallback(dispatch).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        requests: state.requests,
        task,
    }
}
