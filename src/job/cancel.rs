//! Cooperative cancellation and bounded polling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{ChannelError, ConvergentError, Result};

/// A clonable cancellation signal.
///
/// Every clone observes the same flag; once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

/// Interval and iteration bound for polling a transitional state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two probes.
    pub interval: Duration,
    /// Maximum number of probes before giving up.
    pub max_iterations: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_iterations: 120,
        }
    }
}

impl CancellationSignal {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            debug!("Cancellation requested");
        }
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Returns `Cancelled` if the signal has fired.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Cancelled` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConvergentError::Channel(ChannelError::Cancelled))
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PollPolicy {
    /// Creates a policy with the given interval and bound.
    #[must_use]
    pub const fn new(interval: Duration, max_iterations: u32) -> Self {
        Self {
            interval,
            max_iterations,
        }
    }
}

/// Probes until `probe` reports `true`, the bound is reached, or cancellation.
///
/// Cancellation is checked before every probe and while sleeping between
/// probes. Returns `Ok(false)` when the bound is exhausted.
///
/// # Errors
///
/// Returns `Cancelled` if the signal fires, or the first probe error.
pub async fn poll_until<F, Fut>(
    signal: &CancellationSignal,
    policy: PollPolicy,
    mut probe: F,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    // Reported even when the bound allows no probe at all.
    signal.checkpoint()?;

    for attempt in 1..=policy.max_iterations {
        signal.checkpoint()?;

        if probe().await? {
            debug!("Poll satisfied after {attempt} iteration(s)");
            return Ok(true);
        }

        if attempt < policy.max_iterations {
            tokio::select! {
                () = signal.cancelled() => {
                    return Err(ConvergentError::Channel(ChannelError::Cancelled));
                }
                () = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_signal_is_shared_between_clones() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());

        signal.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.checkpoint().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_future_completes() {
        let signal = CancellationSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() did not complete")
            .expect("task panicked");
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let signal = CancellationSignal::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = PollPolicy::new(Duration::from_millis(1), 10);

        let done = poll_until(&signal, policy, move || async move {
            Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .expect("poll failed");

        assert!(done);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_exhausts_bound() {
        let signal = CancellationSignal::new();
        let policy = PollPolicy::new(Duration::from_millis(1), 4);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let done = poll_until(&signal, policy, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await
        .expect("poll failed");

        assert!(!done);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_until_zero_bound_still_sees_cancel() {
        let policy = PollPolicy::new(Duration::from_millis(1), 0);
        let never_called = || async { Ok(true) };

        let signal = CancellationSignal::new();
        assert!(!poll_until(&signal, policy, never_called).await.expect("poll failed"));

        signal.cancel();
        let result = poll_until(&signal, policy, never_called).await;
        assert!(result.expect_err("should be cancelled").is_cancelled());
    }

    #[tokio::test]
    async fn test_poll_until_stops_on_cancel() {
        let signal = CancellationSignal::new();
        let canceller = signal.clone();
        let calls = AtomicU32::new(0);
        // Far more iterations than the test would tolerate waiting for.
        let policy = PollPolicy::new(Duration::from_millis(5), 10_000);

        let result = poll_until(&signal, policy, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 3 {
                canceller.cancel();
            }
            async { Ok(false) }
        })
        .await;

        assert!(result.expect_err("should be cancelled").is_cancelled());
        assert!(calls.load(Ordering::SeqCst) <= 5);
    }
}
