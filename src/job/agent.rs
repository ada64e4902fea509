//! Agent-side job dispatch.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, ConvergentError, Result};
use crate::resource::{
    CollectJob, ConfigureJob, EnsureJob, FirewallRule, RegistryKey, RegistryValue, Resource,
    Service, VirtualDirectory, WebApplication, WebSite,
};
use crate::script::ScriptJob;

use super::cancel::CancellationSignal;
use super::context::{AgentResources, Job, JobContext};
use super::envelope::{AgentMessage, JobOutcome, JobRequest};
use super::events::EventEmitter;
use super::wire;

/// Decodes, runs and encodes one job kind.
#[async_trait]
trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<Vec<u8>>;
}

struct TypedHandler<J>(PhantomData<fn() -> J>);

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<Vec<u8>> {
        let job: J = wire::from_bytes(payload)?;
        let output = job.execute(ctx).await?;
        Ok(wire::to_bytes(&output)?)
    }
}

/// Executes jobs received from a controller.
pub struct Agent {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    resources: Arc<AgentResources>,
}

impl Agent {
    /// Creates an agent with no job kinds registered.
    #[must_use]
    pub fn new(resources: AgentResources) -> Self {
        Self {
            handlers: HashMap::new(),
            resources: Arc::new(resources),
        }
    }

    /// Creates an agent that understands every built-in job kind.
    #[must_use]
    pub fn with_builtin_jobs(resources: AgentResources) -> Self {
        Self::new(resources)
            .register_resource::<Service>()
            .register_resource::<RegistryKey>()
            .register_resource::<RegistryValue>()
            .register_resource::<FirewallRule>()
            .register_resource::<WebSite>()
            .register_resource::<WebApplication>()
            .register_resource::<VirtualDirectory>()
            .register::<ScriptJob>()
    }

    /// Registers a job kind.
    #[must_use]
    pub fn register<J: Job>(mut self) -> Self {
        self.handlers
            .insert(J::kind(), Arc::new(TypedHandler::<J>(PhantomData)));
        self
    }

    /// Registers the collect, configure and ensure jobs of one resource kind.
    #[must_use]
    pub fn register_resource<R: Resource>(self) -> Self {
        self.register::<CollectJob<R>>()
            .register::<ConfigureJob<R>>()
            .register::<EnsureJob<R>>()
    }

    /// Returns the registered job kinds, sorted.
    #[must_use]
    pub fn job_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Executes one request.
    ///
    /// Always ends the message stream with exactly one `Finished`, after
    /// every event the job emitted.
    pub async fn execute(
        &self,
        request: JobRequest,
        cancel: CancellationSignal,
        messages: mpsc::UnboundedSender<AgentMessage>,
    ) {
        let _ = messages.send(AgentMessage::Started);
        let outcome = self.run(&request, cancel, &messages).await;
        let _ = messages.send(AgentMessage::Finished(outcome));
    }

    async fn run(
        &self,
        request: &JobRequest,
        cancel: CancellationSignal,
        messages: &mpsc::UnboundedSender<AgentMessage>,
    ) -> JobOutcome {
        let Some(handler) = self.handlers.get(&request.kind) else {
            warn!("Rejecting unknown job kind '{}'", request.kind);
            let error = ConvergentError::Channel(ChannelError::UnknownJob {
                kind: request.kind.clone(),
            });
            return JobOutcome::Failed(error.to_remote());
        };

        debug!("Executing job '{}'", request.kind);
        let ctx = JobContext::new(
            Arc::clone(&self.resources),
            cancel,
            EventEmitter::new(messages.clone()),
        );

        match handler.handle(&request.payload, &ctx).await {
            Ok(output) => {
                debug!("Job '{}' completed", request.kind);
                JobOutcome::Completed(output)
            }
            Err(e) if e.is_cancelled() => {
                info!("Job '{}' cancelled", request.kind);
                JobOutcome::Cancelled
            }
            Err(e) => {
                warn!("Job '{}' failed: {}", request.kind, e);
                JobOutcome::Failed(e.to_remote())
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("job_kinds", &self.job_kinds())
            .field("resources", &self.resources)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::ErrorCode;
    use crate::job::channel::{AgentChannel, LocalChannel};
    use crate::job::events::JobMonitor;
    use crate::job::state::JobState;
    use crate::job::wire::{wire_record, to_bytes};
    use crate::script::ProcessScriptHost;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Echo {
        text: String,
        fail: bool,
    }

    wire_record!(Echo { fail, text });

    #[async_trait]
    impl Job for Echo {
        type Output = String;

        fn kind() -> String {
            String::from("test.echo")
        }

        async fn execute(&self, ctx: &JobContext) -> Result<String> {
            ctx.events().info(format!("echo {}", self.text));
            if self.fail {
                return Err(ConvergentError::internal("echo failed"));
            }
            ctx.checkpoint()?;
            Ok(self.text.to_uppercase())
        }
    }

    fn agent() -> Agent {
        Agent::new(AgentResources::new(Arc::new(ProcessScriptHost::default()))).register::<Echo>()
    }

    async fn run(agent: &Agent, request: JobRequest, cancel: CancellationSignal) -> Vec<AgentMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent.execute(request, cancel, tx).await;

        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        messages
    }

    fn echo_request(text: &str, fail: bool) -> JobRequest {
        let job = Echo {
            text: text.to_string(),
            fail,
        };
        JobRequest::new(Echo::kind(), to_bytes(&job).expect("encode"))
    }

    #[tokio::test]
    async fn test_events_precede_outcome() {
        let messages = run(&agent(), echo_request("hi", false), CancellationSignal::new()).await;

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], AgentMessage::Started);
        assert!(matches!(messages[1], AgentMessage::Event(_)));
        let expected = to_bytes(&String::from("HI")).expect("encode");
        assert_eq!(messages[2], AgentMessage::Finished(JobOutcome::Completed(expected)));
    }

    #[tokio::test]
    async fn test_errors_become_failed_outcomes() {
        let messages = run(&agent(), echo_request("hi", true), CancellationSignal::new()).await;

        match messages.last() {
            Some(AgentMessage::Finished(JobOutcome::Failed(failure))) => {
                assert_eq!(failure.code, ErrorCode::Failed);
                assert!(failure.message.contains("echo failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_job_reports_cancelled() {
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let messages = run(&agent(), echo_request("hi", false), cancel).await;

        assert_eq!(messages.last(), Some(&AgentMessage::Finished(JobOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let request = JobRequest::new("nope", vec![]);
        let messages = run(&agent(), request, CancellationSignal::new()).await;

        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages.last(),
            Some(AgentMessage::Finished(JobOutcome::Failed(_)))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_fails_without_hanging() {
        let job = ConfigureJob {
            template: Service::named("Spooler"),
            simulation: false,
        };
        let mut payload = to_bytes(&job).expect("encode");
        payload.truncate(payload.len() - 3);

        let agent = Agent::new(AgentResources::new(Arc::new(ProcessScriptHost::default())))
            .register_resource::<Service>();
        let channel = LocalChannel::new(Arc::new(agent));
        let (monitor, _subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");

        let request = JobRequest::new(ConfigureJob::<Service>::kind(), payload);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            channel.transmit(request, &CancellationSignal::new(), &monitor),
        )
        .await
        .expect("agent answered")
        .expect("transmit");

        match outcome {
            JobOutcome::Failed(failure) => {
                assert_eq!(failure.code, ErrorCode::Deserialization);
                assert!(failure.message.contains("end of input"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_builtin_jobs_cover_every_kind() {
        let agent = Agent::with_builtin_jobs(AgentResources::new(Arc::new(
            ProcessScriptHost::default(),
        )));
        let kinds = agent.job_kinds();

        assert_eq!(kinds.len(), 7 * 3 + 1);
        assert!(kinds.contains(&"service.ensure"));
        assert!(kinds.contains(&"web.virtual_directory.collect"));
        assert!(kinds.contains(&"script.run"));
    }
}
