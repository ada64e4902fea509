//! Controller-side job submission.

use tracing::{debug, warn};

use crate::error::{ChannelError, ConvergentError, Result};

use super::cancel::CancellationSignal;
use super::channel::AgentChannel;
use super::context::Job;
use super::envelope::{JobOutcome, JobRequest};
use super::events::JobMonitor;
use super::state::JobState;
use super::wire;

/// Submits typed jobs over an [`AgentChannel`].
#[derive(Debug, Clone)]
pub struct JobClient<C: AgentChannel> {
    channel: C,
}

impl<C: AgentChannel> JobClient<C> {
    /// Creates a client over the given channel.
    #[must_use]
    pub const fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Returns the underlying channel.
    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Runs `job` on the agent and returns its decoded output.
    ///
    /// The monitor is reset, then follows the job through its lifecycle;
    /// events stream into it while the job runs.
    ///
    /// # Errors
    ///
    /// Returns the agent's error rebuilt from its taxonomy code, `Cancelled`
    /// if the signal fired, or a transport error.
    pub async fn submit<J: Job>(
        &self,
        job: &J,
        cancel: &CancellationSignal,
        monitor: &JobMonitor,
    ) -> Result<J::Output> {
        monitor.begin();
        cancel.checkpoint()?;

        let kind = J::kind();
        let request = JobRequest::new(kind.clone(), wire::to_bytes(job)?);
        monitor.advance(JobState::Submitted)?;
        debug!("Submitting '{}' via {}", kind, self.channel.describe());

        let outcome = match self.channel.transmit(request, cancel, monitor).await {
            Ok(outcome) => outcome,
            Err(e) => {
                settle(monitor, JobState::Failed);
                return Err(e);
            }
        };

        match outcome {
            JobOutcome::Completed(payload) => match wire::from_bytes::<J::Output>(&payload) {
                Ok(output) => {
                    settle(monitor, JobState::Completed);
                    Ok(output)
                }
                Err(e) => {
                    warn!("Could not decode the output of '{kind}': {e}");
                    settle(monitor, JobState::Failed);
                    Err(ConvergentError::Wire(e))
                }
            },
            JobOutcome::Failed(failure) => {
                settle(monitor, JobState::Failed);
                Err(failure.into_error())
            }
            JobOutcome::Cancelled => {
                settle(monitor, JobState::Cancelled);
                Err(ConvergentError::Channel(ChannelError::Cancelled))
            }
        }
    }
}

/// Moves the monitor to a terminal state, passing through `Running` when the
/// agent finished without announcing it.
fn settle(monitor: &JobMonitor, terminal: JobState) {
    if terminal == JobState::Completed && monitor.state() == JobState::Submitted {
        let _ = monitor.advance(JobState::Running);
    }
    if let Err(e) = monitor.advance(terminal) {
        debug!("Ignoring job state update: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, RemoteFailure};
    use crate::job::wire::to_bytes;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a canned outcome and records what it was asked to send.
    struct CannedChannel {
        outcome: JobOutcome,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentChannel for CannedChannel {
        async fn transmit(
            &self,
            request: JobRequest,
            _cancel: &CancellationSignal,
            monitor: &JobMonitor,
        ) -> Result<JobOutcome> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.kind.clone());
            }
            monitor.advance(JobState::Running)?;
            Ok(self.outcome.clone())
        }

        fn describe(&self) -> String {
            String::from("canned")
        }
    }

    #[derive(Debug)]
    struct Ping;

    impl crate::job::wire::Wire for Ping {
        fn encode(&self, _writer: &mut crate::job::wire::WireWriter) {}

        fn decode(
            _reader: &mut crate::job::wire::WireReader<'_>,
        ) -> std::result::Result<Self, crate::error::WireError> {
            Ok(Self)
        }
    }

    #[async_trait]
    impl Job for Ping {
        type Output = String;

        fn kind() -> String {
            String::from("test.ping")
        }

        async fn execute(&self, _ctx: &crate::job::context::JobContext) -> Result<String> {
            Ok(String::from("pong"))
        }
    }

    fn client(outcome: JobOutcome) -> JobClient<CannedChannel> {
        JobClient::new(CannedChannel {
            outcome,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_submit_decodes_output() {
        let payload = to_bytes(&String::from("pong")).expect("encode");
        let client = client(JobOutcome::Completed(payload));
        let (monitor, subscription) = JobMonitor::new();

        let output = client
            .submit(&Ping, &CancellationSignal::new(), &monitor)
            .await
            .expect("submit");

        assert_eq!(output, "pong");
        assert_eq!(subscription.state(), JobState::Completed);
        let seen = client.channel().seen.lock().expect("lock");
        assert_eq!(seen.as_slice(), ["test.ping"]);
    }

    #[tokio::test]
    async fn test_failure_is_rebuilt() {
        let client = client(JobOutcome::Failed(RemoteFailure {
            code: ErrorCode::ResourceMissing,
            kind: String::from("web.application"),
            key: String::from("site/app"),
            message: String::from("web.site 'site' does not exist"),
            exit_code: 0,
        }));
        let (monitor, subscription) = JobMonitor::new();

        let err = client
            .submit(&Ping, &CancellationSignal::new(), &monitor)
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), ErrorCode::ResourceMissing);
        assert_eq!(subscription.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_outcome() {
        let client = client(JobOutcome::Cancelled);
        let (monitor, subscription) = JobMonitor::new();

        let err = client
            .submit(&Ping, &CancellationSignal::new(), &monitor)
            .await
            .expect_err("should be cancelled");

        assert!(err.is_cancelled());
        assert_eq!(subscription.state(), JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_already_cancelled_is_not_sent() {
        let client = client(JobOutcome::Cancelled);
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let (monitor, _subscription) = JobMonitor::new();

        let err = client
            .submit(&Ping, &cancel, &monitor)
            .await
            .expect_err("should be cancelled");

        assert!(err.is_cancelled());
        assert!(client.channel().seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_garbage_output_is_a_wire_error() {
        let client = client(JobOutcome::Completed(vec![1, 2]));
        let (monitor, _subscription) = JobMonitor::new();

        let err = client
            .submit(&Ping, &CancellationSignal::new(), &monitor)
            .await
            .expect_err("should fail");

        assert!(matches!(err, ConvergentError::Wire(_)));
    }
}
