//! `sling-it-client` is an async HTTP client for integration tests against a
//! running Sling content-repository server.
//!
//! The crate centres on a few pieces:
//! - [`SlingClient`]: requests with expected statuses, retries and a session
//! - [`Poller`]: waits until asynchronous server state converges
//! - [`osgi::OsgiConsoleClient`], [`query::QueryClient`] and
//!   [`indexing::IndexingClient`]: domain helpers built on the two above

mod client;
mod error;
mod executor;
mod options;
mod polling;
mod request;
mod retry;
mod session;
mod types;

pub mod indexing;
pub mod interceptor;
pub mod osgi;
pub mod query;
pub mod user_agent;

pub use client::{SlingClient, SlingClientBuilder};
pub use error::SlingClientError;
pub use executor::RequestExecutor;
pub use options::{
    parse_status_codes, ClientOptions, RetryConfig, DEFAULT_SUDO_COOKIE, ENV_HTTP_DELAY,
    ENV_HTTP_LOG_RETRIES, ENV_HTTP_RETRIES, ENV_HTTP_RETRIES_DELAY,
    ENV_HTTP_RETRIES_ERROR_CODES, ENV_HTTP_TIMEOUT_SECS, ENV_PASSWORD, ENV_TIMEOUT_MULTIPLIER,
    ENV_URL, ENV_USER,
};
pub use polling::{PollOutcome, Poller, ProbeOutcome};
pub use request::{MultipartField, RequestBody, SlingRequest};
pub use retry::{RetryContext, RetryStrategy};
pub use session::{Cookie, CookieStore, Credentials, Session};
pub use types::{RequestSummary, SlingResponse};

pub type Result<T> = std::result::Result<T, SlingClientError>;
