//! Transports between the controller and an agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ChannelError, ConvergentError, Result};

use super::agent::Agent;
use super::cancel::CancellationSignal;
use super::envelope::{AgentMessage, JobOutcome, JobRequest};
use super::events::JobMonitor;
use super::state::JobState;

/// How long a cancelled job may take to report back before the
/// controller gives up on it.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Carries one request to an agent and waits for its outcome.
///
/// Implementations forward cancellation to the agent, deliver every event
/// to the monitor in order, and move the monitor to `Running` when the
/// agent reports that it started.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Sends the request and waits for the terminal outcome.
    async fn transmit(
        &self,
        request: JobRequest,
        cancel: &CancellationSignal,
        monitor: &JobMonitor,
    ) -> Result<JobOutcome>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl<T: AgentChannel + ?Sized> AgentChannel for Arc<T> {
    async fn transmit(
        &self,
        request: JobRequest,
        cancel: &CancellationSignal,
        monitor: &JobMonitor,
    ) -> Result<JobOutcome> {
        (**self).transmit(request, cancel, monitor).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[async_trait]
impl AgentChannel for Box<dyn AgentChannel> {
    async fn transmit(
        &self,
        request: JobRequest,
        cancel: &CancellationSignal,
        monitor: &JobMonitor,
    ) -> Result<JobOutcome> {
        self.as_ref().transmit(request, cancel, monitor).await
    }

    fn describe(&self) -> String {
        self.as_ref().describe()
    }
}

/// Reads agent messages until the outcome arrives.
///
/// After cancellation fires the agent gets `grace` to answer; past that the
/// job is reported as cancelled without its outcome.
pub(crate) async fn pump_messages(
    messages: &mut mpsc::UnboundedReceiver<AgentMessage>,
    cancel: &CancellationSignal,
    monitor: &JobMonitor,
    grace: Duration,
) -> Result<JobOutcome> {
    let mut deadline: Option<Instant> = None;

    loop {
        let message = if cancel.is_cancelled() {
            let deadline = *deadline.get_or_insert_with(|| Instant::now() + grace);
            match tokio::time::timeout_at(deadline, messages.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    warn!("Agent did not acknowledge cancellation within {grace:?}");
                    return Ok(JobOutcome::Cancelled);
                }
            }
        } else {
            tokio::select! {
                message = messages.recv() => message,
                () = cancel.cancelled() => continue,
            }
        };

        match message {
            Some(AgentMessage::Started) => {
                if monitor.state() == JobState::Submitted {
                    monitor.advance(JobState::Running)?;
                }
            }
            Some(AgentMessage::Event(event)) => monitor.deliver(event),
            Some(AgentMessage::Finished(outcome)) => return Ok(outcome),
            None => {
                return Err(ConvergentError::Channel(ChannelError::failure(
                    "agent closed the channel without reporting an outcome",
                )));
            }
        }
    }
}

/// Runs jobs on an in-process agent.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    agent: Arc<Agent>,
    cancel_grace: Duration,
}

impl LocalChannel {
    /// Creates a channel to an in-process agent.
    #[must_use]
    pub const fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Sets how long a cancelled job may take to report back.
    #[must_use]
    pub const fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

#[async_trait]
impl AgentChannel for LocalChannel {
    async fn transmit(
        &self,
        request: JobRequest,
        cancel: &CancellationSignal,
        monitor: &JobMonitor,
    ) -> Result<JobOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(&self.agent);
        let job_cancel = cancel.clone();

        debug!("Dispatching '{}' to the local agent", request.kind);
        let task = tokio::spawn(async move { agent.execute(request, job_cancel, tx).await });

        let result = pump_messages(&mut rx, cancel, monitor, self.cancel_grace).await;
        if !matches!(result, Ok(JobOutcome::Completed(_) | JobOutcome::Failed(_))) {
            task.abort();
        }
        result
    }

    fn describe(&self) -> String {
        String::from("local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::context::{AgentResources, Job, JobContext};
    use crate::job::wire::{to_bytes, wire_record};
    use crate::script::ProcessScriptHost;

    #[derive(Debug, Clone)]
    struct Sleeper {
        millis: u64,
        ignore_cancel: bool,
    }

    wire_record!(Sleeper {
        ignore_cancel,
        millis,
    });

    #[async_trait]
    impl Job for Sleeper {
        type Output = u64;

        fn kind() -> String {
            String::from("test.sleep")
        }

        async fn execute(&self, ctx: &JobContext) -> Result<u64> {
            ctx.events().progress(Some(50), Some(String::from("sleeping")));
            let sleep = tokio::time::sleep(Duration::from_millis(self.millis));
            if self.ignore_cancel {
                sleep.await;
            } else {
                tokio::select! {
                    () = sleep => {}
                    () = ctx.cancel().cancelled() => ctx.checkpoint()?,
                }
            }
            Ok(self.millis)
        }
    }

    fn channel() -> LocalChannel {
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()));
        LocalChannel::new(Arc::new(Agent::new(resources).register::<Sleeper>()))
    }

    fn request(millis: u64, ignore_cancel: bool) -> JobRequest {
        let job = Sleeper {
            millis,
            ignore_cancel,
        };
        JobRequest::new(Sleeper::kind(), to_bytes(&job).expect("encode"))
    }

    #[tokio::test]
    async fn test_local_channel_completes() {
        let (monitor, subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");

        let outcome = channel()
            .transmit(request(1, false), &CancellationSignal::new(), &monitor)
            .await
            .expect("transmit");

        assert_eq!(outcome, JobOutcome::Completed(to_bytes(&1u64).expect("encode")));
        assert_eq!(subscription.state(), JobState::Running);
        assert_eq!(
            subscription.latest_progress().and_then(|p| p.percent_complete),
            Some(50)
        );
    }

    #[tokio::test]
    async fn test_local_channel_forwards_cancel() {
        let (monitor, _subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = channel()
            .transmit(request(60_000, false), &cancel, &monitor)
            .await
            .expect("transmit");

        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unresponsive_job_is_abandoned_after_grace() {
        let (monitor, _subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");
        let cancel = CancellationSignal::new();
        cancel.cancel();

        let outcome = channel()
            .with_cancel_grace(Duration::from_millis(50))
            .transmit(request(60_000, true), &cancel, &monitor)
            .await
            .expect("transmit");

        assert_eq!(outcome, JobOutcome::Cancelled);
    }
}
