//! User-agent construction and task-scoped overrides.

use std::fmt;
use std::future::Future;

tokio::task_local! {
    static SCOPED_AGENT: Option<String>;
}

/// Library default agent: `sling-it-client/<version>`.
pub fn default_user_agent() -> String {
    UserAgent::new(env!("CARGO_PKG_NAME"), Some(env!("CARGO_PKG_VERSION"))).to_string()
}

/// Runs `future` with `agent` as the user agent for every request it issues.
///
/// The override is bound to the current task and ends with the future.
/// Blank agents leave the outer setting untouched.
pub async fn scope<F>(agent: impl Into<String>, future: F) -> F::Output
where
    F: Future,
{
    let agent = normalize(Some(agent.into()));
    match agent {
        Some(agent) => SCOPED_AGENT.scope(Some(agent), future).await,
        None => future.await,
    }
}

/// Agent set by the innermost enclosing [`scope`], if any.
pub fn current() -> Option<String> {
    SCOPED_AGENT.try_with(Clone::clone).ok().flatten()
}

/// Resolution order: request override, task scope, client setting, library default.
pub(crate) fn resolve(request: Option<&str>, client: Option<&str>) -> String {
    normalize(request.map(str::to_owned))
        .or_else(current)
        .or_else(|| normalize(client.map(str::to_owned)))
        .unwrap_or_else(default_user_agent)
}

fn normalize(agent: Option<String>) -> Option<String> {
    agent.filter(|agent| !agent.trim().is_empty())
}

/// Token list such as `title/1.0 (detail) next/2.0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAgent {
    title: String,
    version: Option<String>,
    details: Vec<UserAgent>,
    next: Vec<UserAgent>,
}

impl UserAgent {
    pub fn new(title: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            title: title.into(),
            version: version.map(str::to_owned),
            details: Vec::new(),
            next: Vec::new(),
        }
    }

    /// Appends a token after this one.
    pub fn append(mut self, token: UserAgent) -> Self {
        self.next.push(token);
        self
    }

    /// Appends a token inside this one's parenthesised details.
    pub fn append_details(mut self, token: UserAgent) -> Self {
        self.details.push(token);
        self
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title)?;
        if let Some(version) = &self.version {
            write!(f, "/{version}")?;
        }
        if !self.details.is_empty() {
            f.write_str(" (")?;
            write_tokens(f, &self.details)?;
            f.write_str(")")?;
        }
        for token in &self.next {
            write!(f, " {token}")?;
        }
        Ok(())
    }
}

fn write_tokens(f: &mut fmt::Formatter<'_>, tokens: &[UserAgent]) -> fmt::Result {
    for (idx, token) in tokens.iter().enumerate() {
        if idx > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{token}")?;
    }
    Ok(())
}
