//! Polling waiter.
//!
//! Every "wait until the cloud says so" loop in the crate goes through
//! [`Waiter::until`]: a predicate polled at a fixed interval until it yields
//! a value or the deadline passes. [`Waiter::attempts`] bounds the loop by
//! the number of checks instead, for checks whose own duration varies. An optional
//! cancellation token ends the wait early.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a wait ended without a value.
#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },

    #[error(transparent)]
    Failed(E),
}

/// A `{predicate, interval, deadline}` polling loop.
#[derive(Debug, Clone)]
pub struct Waiter {
    interval: Duration,
    deadline: Duration,
    max_attempts: Option<u32>,
    cancel: Option<CancellationToken>,
}

impl Waiter {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            max_attempts: None,
            cancel: None,
        }
    }

    /// Checks exactly `attempts` times, `interval` apart, however long each
    /// check takes. Exhaustion is reported as [`WaitError::Timeout`].
    pub fn attempts(interval: Duration, attempts: u32) -> Self {
        Self {
            interval,
            deadline: Duration::MAX,
            max_attempts: Some(attempts.max(1)),
            cancel: None,
        }
    }

    /// Ends the wait with [`WaitError::Cancelled`] once `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Polls `probe` until it returns `Ok(Some(_))`.
    ///
    /// The probe runs once immediately and then after every interval. It
    /// always gets one last chance at the deadline. A probe error ends the
    /// wait at once.
    pub async fn until<T, E, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let start = Instant::now();
        let mut checks = 0u32;

        loop {
            if self.is_cancelled() {
                return Err(WaitError::Cancelled {
                    what: what.to_string(),
                });
            }

            if let Some(value) = probe().await.map_err(WaitError::Failed)? {
                return Ok(value);
            }
            checks += 1;

            let waited = start.elapsed();
            let exhausted = self.max_attempts.is_some_and(|max| checks >= max);
            if exhausted || waited >= self.deadline {
                return Err(WaitError::Timeout {
                    what: what.to_string(),
                    waited,
                });
            }

            let pause = self.interval.min(self.deadline - waited);
            tracing::debug!("Waiting {:?} for {}", pause, what);

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(WaitError::Cancelled { what: what.to_string() });
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}
