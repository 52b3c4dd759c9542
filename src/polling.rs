//! Fixed-cadence polling until asynchronous server state converges.
//!
//! The probe always runs at least once. Between probes the engine sleeps
//! for the configured delay, so the cadence also depends on how long each
//! probe takes.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Result, SlingClientError};

const DEFAULT_DESCRIPTION: &str = "Call failed to return true";

/// Result of one probe invocation.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The awaited state is reached.
    Converged,
    /// Not yet; keep polling.
    NotYet,
    /// The probe failed in a recoverable way; recorded and polling continues.
    Failed(SlingClientError),
    /// The probe failed in a way more polling cannot fix.
    Fatal(SlingClientError),
}

impl From<bool> for ProbeOutcome {
    fn from(converged: bool) -> Self {
        if converged {
            Self::Converged
        } else {
            Self::NotYet
        }
    }
}

impl From<Result<bool>> for ProbeOutcome {
    fn from(result: Result<bool>) -> Self {
        match result {
            Ok(converged) => converged.into(),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Summary of a finished poll.
#[derive(Debug)]
pub struct PollOutcome {
    pub succeeded: bool,
    pub elapsed: Duration,
    pub attempts: usize,
    pub last_error: Option<String>,
}

/// Bounded polling loop.
#[derive(Clone, Debug)]
pub struct Poller {
    timeout: Duration,
    delay: Duration,
    multiplier: f64,
    description: String,
    cancel: Option<CancellationToken>,
}

impl Poller {
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        Self {
            timeout,
            delay,
            multiplier: 1.0,
            description: DEFAULT_DESCRIPTION.to_owned(),
            cancel: None,
        }
    }

    pub fn from_millis(timeout_ms: u64, delay_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(delay_ms),
        )
    }

    /// Scales the timeout, for slow environments. Non-positive or
    /// non-finite factors are ignored.
    pub fn multiplier(mut self, factor: f64) -> Self {
        if factor.is_finite() && factor > 0.0 {
            self.multiplier = factor;
        }
        self
    }

    /// Text the timeout error starts with, e.g. `"Bundle x did not start"`.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Aborts the poll with [`SlingClientError::Cancelled`] when `token` fires.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Scaled timeout, saturating at [`Duration::MAX`].
    pub fn effective_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout.as_secs_f64() * self.multiplier)
            .unwrap_or(Duration::MAX)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Invokes `probe` until it converges or the effective timeout elapses.
    pub async fn poll<F, Fut, O>(&self, mut probe: F) -> Result<PollOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = O>,
        O: Into<ProbeOutcome>,
    {
        let start = Instant::now();
        let timeout = self.effective_timeout();
        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;

        loop {
            attempts += 1;
            match probe().await.into() {
                ProbeOutcome::Converged => {
                    let elapsed = start.elapsed();
                    debug!(
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "poll converged"
                    );
                    return Ok(PollOutcome {
                        succeeded: true,
                        elapsed,
                        attempts,
                        last_error,
                    });
                }
                ProbeOutcome::NotYet => {}
                ProbeOutcome::Failed(err) => {
                    debug!(attempts, error = %err, "probe failed, will retry");
                    last_error = Some(err.to_string());
                }
                ProbeOutcome::Fatal(err) => return Err(err),
            }

            if start.elapsed() >= timeout {
                break;
            }
            self.pause().await?;
        }

        let elapsed = start.elapsed();
        Err(SlingClientError::PollTimeout {
            message: format!(
                "{} in {} ms (delay {} ms). Last error: {}",
                self.description,
                timeout.as_millis(),
                self.delay.as_millis(),
                last_error.as_deref().unwrap_or("none")
            ),
            timeout,
            delay: self.delay,
            elapsed,
            last_error,
        })
    }

    async fn pause(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(SlingClientError::Cancelled),
                _ = sleep(self.delay) => Ok(()),
            },
            None => {
                sleep(self.delay).await;
                Ok(())
            }
        }
    }
}
