//! The job trait and the agent-side execution context.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::resource::{AdapterRegistry, KindGuard, KindLocks, Resource, ResourceAdapter, ResourceKind};
use crate::script::ScriptHost;

use super::cancel::{CancellationSignal, PollPolicy};
use super::events::EventEmitter;
use super::wire::Wire;

/// A serializable unit of remote work.
///
/// The controller encodes the job, the agent decodes and executes it, and
/// the output travels back in the same wire schema.
#[async_trait]
pub trait Job: Wire + Send + Sync + 'static {
    /// Result returned by the agent.
    type Output: Wire + Send + 'static;

    /// Stable name the agent dispatches on.
    fn kind() -> String;

    /// Executes the job on the agent.
    async fn execute(&self, ctx: &JobContext) -> Result<Self::Output>;
}

/// Long-lived facilities shared by every job an agent runs.
pub struct AgentResources {
    adapters: AdapterRegistry,
    locks: KindLocks,
    script_host: Arc<dyn ScriptHost>,
    poll_policy: PollPolicy,
}

/// Per-execution view handed to [`Job::execute`].
#[derive(Clone)]
pub struct JobContext {
    resources: Arc<AgentResources>,
    cancel: CancellationSignal,
    events: EventEmitter,
}

impl AgentResources {
    /// Creates resources with no adapters registered.
    #[must_use]
    pub fn new(script_host: Arc<dyn ScriptHost>) -> Self {
        Self {
            adapters: AdapterRegistry::new(),
            locks: KindLocks::new(),
            script_host,
            poll_policy: PollPolicy::default(),
        }
    }

    /// Registers the adapter for one resource kind.
    #[must_use]
    pub fn with_adapter<R: Resource>(mut self, adapter: Arc<dyn ResourceAdapter<R>>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Replaces the adapter registry.
    #[must_use]
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Injects the per-kind lock registry.
    #[must_use]
    pub fn with_locks(mut self, locks: KindLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Sets the policy used when polling transitional states.
    #[must_use]
    pub const fn with_poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    /// Returns the registered adapters.
    #[must_use]
    pub const fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }
}

impl std::fmt::Debug for AgentResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentResources")
            .field("adapters", &self.adapters)
            .field("poll_policy", &self.poll_policy)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    /// Creates a context for one execution.
    #[must_use]
    pub const fn new(
        resources: Arc<AgentResources>,
        cancel: CancellationSignal,
        events: EventEmitter,
    ) -> Self {
        Self {
            resources,
            cancel,
            events,
        }
    }

    /// Returns the adapter for `R`.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` if the agent has no adapter for the kind.
    pub fn adapter<R: Resource>(&self) -> Result<Arc<dyn ResourceAdapter<R>>> {
        self.resources.adapters.get::<R>()
    }

    /// Acquires the exclusive lock for a resource kind.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancellation fires while waiting.
    pub async fn lock(&self, kind: ResourceKind) -> Result<KindGuard> {
        self.resources.locks.acquire(kind, &self.cancel).await
    }

    /// Returns the script host.
    #[must_use]
    pub fn script_host(&self) -> &dyn ScriptHost {
        self.resources.script_host.as_ref()
    }

    /// Returns the polling policy for transitional states.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        self.resources.poll_policy
    }

    /// Returns the cancellation signal.
    #[must_use]
    pub const fn cancel(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// Returns the event emitter.
    #[must_use]
    pub const fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Returns `Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the signal has fired.
    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.checkpoint()
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
