//! In-memory host used by the agent binary and the tests.
//!
//! [`MemoryHost`] stores the actual state of every resource in its wire
//! encoding, keyed by kind and configuration key. The adapters apply the same
//! rules a native adapter would: per-kind locking, prerequisite checks,
//! no-op detection and simulation.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AdapterError, ConvergentError, Result};
use crate::job::wire::{from_bytes, to_bytes};
use crate::job::{poll_until, JobContext};

use super::adapter::{AdapterRegistry, ResourceAdapter};
use super::any::{with_template, AnyTemplate};
use super::firewall::FirewallRule;
use super::kind::ResourceKind;
use super::registry::{RegistryKey, RegistryValue};
use super::service::{Service, ServiceState};
use super::template::Resource;
use super::web::{VirtualDirectory, WebApplication, WebSite};

type RecordKey = (ResourceKind, String);

#[derive(Debug, Default)]
struct HostState {
    records: HashMap<RecordKey, Vec<u8>>,
    configure_calls: HashMap<ResourceKind, usize>,
}

/// Actual state of a simulated host.
#[derive(Debug, Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
}

impl MemoryHost {
    /// Creates an empty host.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> Result<MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| ConvergentError::internal("memory host state poisoned"))
    }

    /// Reads the stored state of a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored bytes cannot be decoded.
    pub fn get<R: Resource>(&self, key: &str) -> Result<Option<R>> {
        let state = self.state()?;
        match state.records.get(&(R::KIND, key.to_string())) {
            Some(bytes) => Ok(Some(from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores a resource, or removes it when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be encoded.
    pub fn put<R: Resource>(&self, resource: &R) -> Result<()> {
        let key = (R::KIND, resource.configuration_key());
        let mut state = self.state()?;
        if resource.exists() {
            state.records.insert(key, to_bytes(resource)?);
        } else {
            state.records.remove(&key);
        }
        Ok(())
    }

    /// Returns true if a resource of `kind` with `key` is stored.
    #[must_use]
    pub fn contains(&self, kind: ResourceKind, key: &str) -> bool {
        self.state()
            .is_ok_and(|state| state.records.contains_key(&(kind, key.to_string())))
    }

    /// Stores a template as-is, e.g. from an inventory file.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is invalid.
    pub fn seed(&self, template: &AnyTemplate) -> Result<()> {
        template.validate()?;
        with_template!(template, t => self.put(t))
    }

    /// Number of resources stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().map_or(0, |state| state.records.len())
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of configure calls received for `kind`, simulated ones included.
    #[must_use]
    pub fn configure_calls(&self, kind: ResourceKind) -> usize {
        self.state()
            .map_or(0, |state| state.configure_calls.get(&kind).copied().unwrap_or(0))
    }

    fn record_configure(&self, kind: ResourceKind) -> Result<()> {
        *self.state()?.configure_calls.entry(kind).or_insert(0) += 1;
        Ok(())
    }

    /// Registers an adapter backed by this host for every kind.
    ///
    /// Services take `start_delay_polls` extra polls to go from
    /// `StartPending` to `Running`.
    #[must_use]
    pub fn adapters(self: &Arc<Self>, start_delay_polls: u32) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register::<Service>(Arc::new(MemoryServiceAdapter::new(
            Arc::clone(self),
            start_delay_polls,
        )));
        registry.register::<RegistryKey>(Arc::new(MemoryAdapter::new(Arc::clone(self))));
        registry.register::<RegistryValue>(Arc::new(MemoryAdapter::new(Arc::clone(self))));
        registry.register::<FirewallRule>(Arc::new(MemoryAdapter::new(Arc::clone(self))));
        registry.register::<WebSite>(Arc::new(MemoryAdapter::new(Arc::clone(self))));
        registry.register::<WebApplication>(Arc::new(MemoryAdapter::new(Arc::clone(self))));
        registry.register::<VirtualDirectory>(Arc::new(MemoryAdapter::new(Arc::clone(self))));
        registry
    }

    /// Writes `template` over the stored state.
    ///
    /// Returns the state that was (or, in simulation, would be) written, or
    /// `None` when nothing needed to change.
    fn apply<R: Resource>(&self, template: &R, simulation: bool, ctx: &JobContext) -> Result<Option<R>> {
        self.record_configure(R::KIND)?;
        let description = template.describe();

        for prerequisite in template.prerequisites() {
            if self.contains(prerequisite.kind, &prerequisite.key) {
                continue;
            }
            if template.exists() {
                return Err(AdapterError::missing(
                    R::KIND.type_name(),
                    template.configuration_key(),
                    prerequisite.to_string(),
                )
                .into());
            }
            ctx.events()
                .warn(format!("{prerequisite} does not exist; nothing to remove for {description}"));
            return Ok(None);
        }

        let current = self.get::<R>(&template.configuration_key())?;
        let next = template.overlay(current.as_ref());
        let unchanged = match &current {
            Some(current) => *current == next,
            None => !next.exists(),
        };
        if unchanged {
            ctx.events().info(format!("{description} already matches"));
            return Ok(None);
        }

        let verb = match (&current, next.exists()) {
            (None, _) => "create",
            (Some(_), true) => "update",
            (Some(_), false) => "remove",
        };
        if simulation {
            ctx.events().info(format!("[simulation] Would {verb} {description}"));
            return Ok(Some(next));
        }

        self.put(&next)?;
        debug!("Memory host: {verb} {description}");
        ctx.events().info(format!("{verb} {description}: done"));
        Ok(Some(next))
    }
}

/// Generic adapter over a [`MemoryHost`].
#[derive(Debug)]
pub struct MemoryAdapter<R> {
    host: Arc<MemoryHost>,
    _kind: PhantomData<fn() -> R>,
}

impl<R> MemoryAdapter<R> {
    /// Creates an adapter over `host`.
    #[must_use]
    pub const fn new(host: Arc<MemoryHost>) -> Self {
        Self {
            host,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Resource> ResourceAdapter<R> for MemoryAdapter<R> {
    async fn collect(&self, template: &R, ctx: &JobContext) -> Result<R> {
        let _guard = ctx.lock(R::KIND).await?;
        Ok(self
            .host
            .get::<R>(&template.configuration_key())?
            .unwrap_or_else(|| template.absent()))
    }

    async fn configure(&self, template: &R, simulation: bool, ctx: &JobContext) -> Result<()> {
        let _guard = ctx.lock(R::KIND).await?;
        self.host.apply(template, simulation, ctx).map(|_| ())
    }
}

/// Service adapter that models the `StartPending` transition.
#[derive(Debug)]
pub struct MemoryServiceAdapter {
    host: Arc<MemoryHost>,
    start_delay_polls: u32,
}

impl MemoryServiceAdapter {
    /// Creates an adapter whose services need `start_delay_polls` polls to
    /// reach `Running`.
    #[must_use]
    pub const fn new(host: Arc<MemoryHost>, start_delay_polls: u32) -> Self {
        Self {
            host,
            start_delay_polls,
        }
    }

    async fn wait_until_running(&self, mut service: Service, ctx: &JobContext) -> Result<()> {
        service.state = Some(ServiceState::StartPending);
        self.host.put(&service)?;
        ctx.events()
            .progress(None, Some(format!("Starting service {}", service.name)));

        let mut remaining = self.start_delay_polls;
        let host = &self.host;
        let started = poll_until(ctx.cancel(), ctx.poll_policy(), || {
            let result = if remaining == 0 {
                service.state = Some(ServiceState::Running);
                host.put(&service).map(|()| true)
            } else {
                remaining -= 1;
                Ok(false)
            };
            std::future::ready(result)
        })
        .await?;

        if started {
            Ok(())
        } else {
            Err(AdapterError::configure_failed(
                ResourceKind::Service.type_name(),
                service.configuration_key(),
                format!(
                    "service did not reach Running within {} polls",
                    ctx.poll_policy().max_iterations
                ),
            )
            .into())
        }
    }
}

#[async_trait]
impl ResourceAdapter<Service> for MemoryServiceAdapter {
    async fn collect(&self, template: &Service, ctx: &JobContext) -> Result<Service> {
        let _guard = ctx.lock(ResourceKind::Service).await?;
        Ok(self
            .host
            .get::<Service>(&template.configuration_key())?
            .unwrap_or_else(|| template.absent()))
    }

    async fn configure(&self, template: &Service, simulation: bool, ctx: &JobContext) -> Result<()> {
        let _guard = ctx.lock(ResourceKind::Service).await?;
        let was_running = self
            .host
            .get::<Service>(&template.configuration_key())?
            .is_some_and(|s| s.state == Some(ServiceState::Running));

        let written = self.host.apply(template, simulation, ctx)?;
        match written {
            Some(service)
                if !simulation && !was_running && service.state == Some(ServiceState::Running) =>
            {
                self.wait_until_running(service, ctx).await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AgentResources, CancellationSignal, EventEmitter, PollPolicy};
    use crate::resource::StartMode;
    use crate::script::ProcessScriptHost;
    use std::time::Duration;

    fn context(host: &Arc<MemoryHost>, cancel: CancellationSignal) -> JobContext {
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()))
            .with_adapters(host.adapters(2))
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 10));
        JobContext::new(Arc::new(resources), cancel, EventEmitter::discard())
    }

    fn running_spooler() -> Service {
        Service {
            start_mode: Some(StartMode::Automatic),
            state: Some(ServiceState::Running),
            ..Service::named("Spooler")
        }
    }

    #[tokio::test]
    async fn test_configure_is_idempotent() {
        let host = MemoryHost::new();
        let ctx = context(&host, CancellationSignal::new());
        let adapter = ctx.adapter::<Service>().expect("adapter");

        adapter.configure(&running_spooler(), false, &ctx).await.expect("first");
        let after_first = host.get::<Service>("spooler").expect("get");
        adapter.configure(&running_spooler(), false, &ctx).await.expect("second");

        assert_eq!(host.get::<Service>("spooler").expect("get"), after_first);
        assert_eq!(
            after_first.and_then(|s| s.state),
            Some(ServiceState::Running)
        );
    }

    #[tokio::test]
    async fn test_simulation_changes_nothing() {
        let host = MemoryHost::new();
        let ctx = context(&host, CancellationSignal::new());
        let adapter = ctx.adapter::<Service>().expect("adapter");

        adapter.configure(&running_spooler(), true, &ctx).await.expect("simulate");

        assert!(host.is_empty());
        assert_eq!(host.configure_calls(ResourceKind::Service), 1);
    }

    #[tokio::test]
    async fn test_missing_parent_blocks_creation_only() {
        let host = MemoryHost::new();
        let ctx = context(&host, CancellationSignal::new());
        let adapter = ctx.adapter::<WebApplication>().expect("adapter");
        let mut app = WebApplication {
            site: String::from("Shop"),
            path: String::from("/api"),
            exists: true,
            physical_path: None,
            application_pool: None,
        };

        let err = adapter.configure(&app, false, &ctx).await.expect_err("missing site");
        assert!(matches!(
            err,
            ConvergentError::Adapter(AdapterError::ResourceMissing { .. })
        ));

        app.exists = false;
        adapter.configure(&app, false, &ctx).await.expect("removal is a no-op");
    }

    #[tokio::test]
    async fn test_cancel_during_start_leaves_pending_state() {
        let host = MemoryHost::new();
        let cancel = CancellationSignal::new();
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()))
            .with_adapters(host.adapters(u32::MAX))
            .with_poll_policy(PollPolicy::new(Duration::from_millis(5), u32::MAX));
        let ctx = JobContext::new(Arc::new(resources), cancel.clone(), EventEmitter::discard());
        let adapter = ctx.adapter::<Service>().expect("adapter");

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            adapter.configure(&running_spooler(), false, &ctx),
        )
        .await
        .expect("configure must observe cancellation")
        .expect_err("should be cancelled");

        assert!(err.is_cancelled());
        let stored = host.get::<Service>("spooler").expect("get").expect("stored");
        assert_eq!(stored.state, Some(ServiceState::StartPending));
    }

    #[tokio::test]
    async fn test_start_that_never_completes_fails() {
        let host = MemoryHost::new();
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()))
            .with_adapters(host.adapters(100))
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 3));
        let ctx = JobContext::new(
            Arc::new(resources),
            CancellationSignal::new(),
            EventEmitter::discard(),
        );
        let adapter = ctx.adapter::<Service>().expect("adapter");

        let err = adapter
            .configure(&running_spooler(), false, &ctx)
            .await
            .expect_err("should time out");
        assert!(matches!(
            err,
            ConvergentError::Adapter(AdapterError::ConfigureFailed { .. })
        ));
    }

    #[test]
    fn test_seed_validates() {
        let host = MemoryHost::new();
        host.seed(&AnyTemplate::Service(Service::named("W3SVC"))).expect("seed");
        assert!(host.contains(ResourceKind::Service, "w3svc"));
        assert!(host.seed(&AnyTemplate::Service(Service::named(""))).is_err());
    }
}
