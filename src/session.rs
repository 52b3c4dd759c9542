//! Per-client session state shared by concurrent interceptor invocations.

use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

use tracing::debug;

/// One stored cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub expires: Option<SystemTime>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: Some("/".to_owned()),
            expires: None,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn matches_path(&self, request_path: &str) -> bool {
        match self.path.as_deref() {
            None | Some("") | Some("/") => true,
            Some(path) => {
                request_path == path
                    || request_path
                        .strip_prefix(path)
                        .is_some_and(|rest| path.ends_with('/') || rest.starts_with('/'))
            }
        }
    }
}

/// Thread-safe cookie jar scoped to a client instance.
///
/// Individual reads and writes are atomic; read-then-expire sequences
/// across threads are not.
#[derive(Debug, Default)]
pub struct CookieStore {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Cookie>> {
        self.cookies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds or replaces the cookie with the same name and path. Cookies
    /// arriving already expired evict the stored one.
    pub fn add(&self, cookie: Cookie) {
        let mut cookies = self.lock();
        cookies.retain(|existing| !(existing.name == cookie.name && existing.path == cookie.path));
        if !cookie.is_expired(SystemTime::now()) {
            cookies.push(cookie);
        }
    }

    /// Unexpired cookies.
    pub fn cookies(&self) -> Vec<Cookie> {
        let now = SystemTime::now();
        let mut cookies = self.lock();
        cookies.retain(|cookie| !cookie.is_expired(now));
        cookies.clone()
    }

    /// First unexpired cookie named `name` (ASCII case-insensitive).
    pub fn get(&self, name: &str) -> Option<Cookie> {
        self.cookies()
            .into_iter()
            .find(|cookie| cookie.name.eq_ignore_ascii_case(name))
    }

    /// Sets an already-past expiry on every cookie named `name`.
    /// Returns whether anything was expired.
    pub fn expire(&self, name: &str) -> bool {
        let past = SystemTime::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut expired = false;
        for cookie in self
            .lock()
            .iter_mut()
            .filter(|cookie| cookie.name.eq_ignore_ascii_case(name))
        {
            cookie.expires = Some(past);
            expired = true;
        }
        expired
    }

    pub fn remove(&self, name: &str) {
        self.lock()
            .retain(|cookie| !cookie.name.eq_ignore_ascii_case(name));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// `Cookie` request header value for `request_path`, if any cookie applies.
    pub fn header_for(&self, request_path: &str) -> Option<String> {
        let value = self
            .cookies()
            .iter()
            .filter(|cookie| cookie.matches_path(request_path))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        (!value.is_empty()).then_some(value)
    }

    pub(crate) fn capture(&self, response: &reqwest::Response) {
        for received in response.cookies() {
            let expires = received
                .max_age()
                .and_then(|max_age| SystemTime::now().checked_add(max_age))
                .or_else(|| received.expires());
            debug!(name = received.name(), "storing cookie from response");
            self.add(Cookie {
                name: received.name().to_owned(),
                value: received.value().to_owned(),
                path: received.path().map(str::to_owned),
                expires,
            });
        }
    }
}

/// Username and password used for basic auth and form login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Mutable state shared by every request issued through one client.
#[derive(Debug)]
pub struct Session {
    cookies: std::sync::Arc<CookieStore>,
    credentials: Option<Credentials>,
    impersonated: RwLock<Option<String>>,
    preemptive_auth: bool,
}

impl Session {
    pub(crate) fn new(
        cookies: std::sync::Arc<CookieStore>,
        credentials: Option<Credentials>,
        preemptive_auth: bool,
    ) -> Self {
        Self {
            cookies,
            credentials,
            impersonated: RwLock::new(None),
            preemptive_auth,
        }
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    pub(crate) fn cookie_store(&self) -> std::sync::Arc<CookieStore> {
        self.cookies.clone()
    }

    /// Credentials of the authenticating user. `None` means anonymous.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn preemptive_auth(&self) -> bool {
        self.preemptive_auth
    }

    /// Effective user: the impersonated one, if any, else the authenticating one.
    pub fn user(&self) -> Option<String> {
        let impersonated = self
            .impersonated
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        impersonated.or_else(|| self.credentials.as_ref().map(|creds| creds.user.clone()))
    }

    pub(crate) fn set_impersonated(&self, user: Option<String>) {
        *self
            .impersonated
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = user;
    }
}
