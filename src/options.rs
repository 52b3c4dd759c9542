use std::collections::BTreeSet;
use std::time::Duration;

use crate::RetryStrategy;

pub const ENV_HTTP_RETRIES: &str = "SLING_IT_HTTP_RETRIES";
pub const ENV_HTTP_RETRIES_DELAY: &str = "SLING_IT_HTTP_RETRIES_DELAY";
pub const ENV_HTTP_LOG_RETRIES: &str = "SLING_IT_HTTP_LOG_RETRIES";
pub const ENV_HTTP_RETRIES_ERROR_CODES: &str = "SLING_IT_HTTP_RETRIES_ERROR_CODES";
pub const ENV_HTTP_DELAY: &str = "SLING_IT_HTTP_DELAY";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "SLING_IT_HTTP_TIMEOUT_SECS";
pub const ENV_TIMEOUT_MULTIPLIER: &str = "SLING_IT_TIMEOUT_MULTIPLIER";
pub const ENV_URL: &str = "SLING_IT_URL";
pub const ENV_USER: &str = "SLING_IT_USER";
pub const ENV_PASSWORD: &str = "SLING_IT_PASSWORD";

pub const DEFAULT_SUDO_COOKIE: &str = "sling.sudo";

/// Retry budget and policy inputs shared by every request of one client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Fixed pause between attempts in milliseconds.
    pub retry_interval_ms: u64,
    /// Emit a warn-level diagnostic record for each retried response.
    pub log_retries: bool,
    /// Status codes worth retrying. Empty means any 5xx.
    pub retryable_status_codes: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_interval_ms: 1_000,
            log_retries: false,
            retryable_status_codes: BTreeSet::new(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: usize, retry_interval_ms: u64) -> Self {
        Self {
            max_retries,
            retry_interval_ms,
            ..Self::default()
        }
    }

    /// Configuration that never retries.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn with_log_retries(mut self, log_retries: bool) -> Self {
        self.log_retries = log_retries;
        self
    }

    pub fn with_retryable_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Reads the `SLING_IT_HTTP_*` retry variables, falling back to
    /// defaults for anything missing or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: parse_or(lookup(ENV_HTTP_RETRIES), defaults.max_retries),
            retry_interval_ms: parse_or(lookup(ENV_HTTP_RETRIES_DELAY), defaults.retry_interval_ms),
            log_retries: lookup(ENV_HTTP_LOG_RETRIES)
                .map(|value| value.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.log_retries),
            retryable_status_codes: lookup(ENV_HTTP_RETRIES_ERROR_CODES)
                .map(|csv| parse_status_codes(&csv))
                .unwrap_or_default(),
        }
    }
}

/// Parses a comma-separated status list, silently dropping bad entries.
pub fn parse_status_codes(csv: &str) -> BTreeSet<u16> {
    csv.split(',')
        .filter_map(|code| code.trim().parse::<u16>().ok())
        .collect()
}

/// Configures HTTP timeout, retry and session behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    pub retry_strategy: RetryStrategy,
    /// Artificial delay before every physical attempt, in milliseconds.
    pub request_delay_ms: u64,
    /// Scaling factor applied to poll timeouts.
    pub timeout_multiplier: f64,
    /// Client-level user agent. `None` uses the library default.
    pub user_agent: Option<String>,
    pub sudo_cookie_name: String,
    /// Session cookie name; when set the client logs in through
    /// `j_security_check` instead of relying on basic auth alone.
    pub login_token_cookie: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            retry: RetryConfig::default(),
            retry_strategy: RetryStrategy::default(),
            request_delay_ms: 0,
            timeout_multiplier: 1.0,
            user_agent: None,
            sudo_cookie_name: DEFAULT_SUDO_COOKIE.to_owned(),
            login_token_cookie: None,
        }
    }
}

impl ClientOptions {
    /// Defaults overridden by the `SLING_IT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let timeout_ms = lookup(ENV_HTTP_TIMEOUT_SECS)
            .and_then(|secs| secs.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1_000))
            .unwrap_or(defaults.timeout_ms);
        let timeout_multiplier = lookup(ENV_TIMEOUT_MULTIPLIER)
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|factor| factor.is_finite() && *factor > 0.0)
            .unwrap_or(defaults.timeout_multiplier);
        Self {
            timeout_ms,
            retry: RetryConfig::from_lookup(&lookup),
            request_delay_ms: parse_or(lookup(ENV_HTTP_DELAY), defaults.request_delay_ms),
            timeout_multiplier,
            ..defaults
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout_multiplier(mut self, factor: f64) -> Self {
        self.timeout_multiplier = factor;
        self
    }

    pub fn with_login_token_cookie(mut self, cookie_name: impl Into<String>) -> Self {
        self.login_token_cookie = Some(cookie_name.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}
