//! Blocking and polling wait modes.
//!
//! A blocking wait parks the thread inside the counter primitive and cannot
//! be interrupted. A polling wait re-reads the counter until the condition
//! holds, which lets the caller stop it through a [`CancelToken`] or a
//! deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::error::{Error, Result};

/// Shared flag that stops polling waits.
///
/// Clones observe the same flag, so one clone can be handed to a polling
/// consumer while another stays with whoever decides to shut it down.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a polling wait re-checks its condition.
#[derive(Debug, Clone, Default)]
pub struct PollPolicy {
    /// Sleep between checks. Zero spins without yielding the CPU.
    pub interval: Duration,
    /// Give up with [`Error::TimedOut`] after this long.
    pub deadline: Option<Duration>,
    /// Give up with [`Error::Cancelled`] once this token is cancelled.
    pub cancel: Option<CancelToken>,
}

impl PollPolicy {
    /// Tight spin with no deadline and no cancellation.
    #[must_use]
    pub fn spin() -> Self {
        Self::default()
    }

    /// Sleep `interval` between checks.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Calls `attempt` until it yields a value.
    ///
    /// The token and deadline are checked after every unsuccessful attempt, so
    /// a condition that already holds wins over a cancelled token.
    ///
    /// # Errors
    ///
    /// Propagates the first attempt error, or returns [`Error::Cancelled`] /
    /// [`Error::TimedOut`].
    pub fn poll_until<T>(&self, mut attempt: impl FnMut() -> Result<Option<T>>) -> Result<T> {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        loop {
            if let Some(value) = attempt()? {
                return Ok(value);
            }
            if let Some(token) = &self.cancel
                && token.is_cancelled()
            {
                return Err(Error::Cancelled);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return Err(Error::TimedOut);
            }
            if self.interval.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(self.interval);
            }
        }
    }
}

/// How a consumer waits for the producer's next slot.
#[derive(Debug, Clone, Default)]
pub enum WaitMode {
    /// Block inside the counter primitive.
    #[default]
    Block,
    /// Re-check the counter under the given policy.
    Poll(PollPolicy),
}

impl From<PollPolicy> for WaitMode {
    fn from(policy: PollPolicy) -> Self {
        Self::Poll(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_returns_first_value() {
        let mut calls = 0;
        let value = PollPolicy::spin()
            .poll_until(|| {
                calls += 1;
                Ok((calls == 3).then_some(calls))
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_poll_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let result: Result<()> = PollPolicy::every(Duration::from_millis(1))
            .with_cancel(token)
            .poll_until(|| Ok(None));
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_poll_ready_condition_beats_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let value = PollPolicy::spin()
            .with_cancel(token)
            .poll_until(|| Ok(Some(7)))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_poll_deadline() {
        let result: Result<()> = PollPolicy::every(Duration::from_millis(1))
            .with_deadline(Duration::from_millis(10))
            .poll_until(|| Ok(None));
        assert!(matches!(result, Err(Error::TimedOut)));
    }

    #[test]
    fn test_poll_propagates_attempt_error() {
        let result: Result<()> = PollPolicy::spin().poll_until(|| Err(Error::Removed));
        assert!(matches!(result, Err(Error::Removed)));
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            remote.cancel();
        });
        let result: Result<()> = PollPolicy::every(Duration::from_micros(100))
            .with_cancel(token)
            .poll_until(|| Ok(None));
        stopper.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
