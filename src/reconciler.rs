//! Controller-side reconciliation.
//!
//! The [`Reconciler`] validates templates locally, resolves credentials,
//! submits collect/configure/ensure jobs to an agent and records the drift
//! status of every resource it touched.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compare::{compare, ComparisonResult};
use crate::config::{ScriptDefinition, TemplateHasher};
use crate::credential::{Credential, CredentialResolver};
use crate::error::{ConvergentError, CredentialError, Result};
use crate::job::{
    AgentChannel, CancellationSignal, Job, JobClient, JobMonitor, LogSink, TracingLogSink,
};
use crate::resource::{
    with_template, AnyTemplate, CollectJob, ConfigureJob, EnsureJob, EnsureReport, Resource,
    ResourceKind,
};
use crate::script::{ScriptJob, ScriptResult};
use crate::state::{DriftRecord, DriftStatus, StateStore};

/// What [`Reconciler::reconcile_all`] does with each template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Collect and compare only.
    Test,
    /// Collect, compare and configure from the controller.
    Ensure {
        /// Log what would change without changing anything.
        simulation: bool,
    },
    /// Run the whole ensure on the agent in one round trip.
    EnsureOnAgent {
        /// Log what would change without changing anything.
        simulation: bool,
    },
}

/// Outcome for one resource of a reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Configuration key.
    pub key: String,
    /// Drift status; `Failed` when `error` is set.
    pub status: DriftStatus,
    /// Drift found before any configure.
    pub differences: ComparisonResult,
    /// Error message for failed resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a reconciliation run over many templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationResult {
    /// One outcome per template, in input order.
    pub outcomes: Vec<ResourceOutcome>,
}

impl ReconciliationResult {
    /// Number of resources with the given status.
    #[must_use]
    pub fn count(&self, status: DriftStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Returns true if any resource is not in its desired state.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.outcomes.iter().any(|o| {
            matches!(
                o.status,
                DriftStatus::Drifted | DriftStatus::NotConverged | DriftStatus::Failed
            )
        })
    }

    /// Returns true if nothing failed or stayed unconverged.
    #[must_use]
    pub fn success(&self) -> bool {
        self.count(DriftStatus::Failed) == 0 && self.count(DriftStatus::NotConverged) == 0
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success() { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  In desired state: {}", self.count(DriftStatus::InDesiredState))?;
        writeln!(f, "  Drifted: {}", self.count(DriftStatus::Drifted))?;
        writeln!(f, "  Converged: {}", self.count(DriftStatus::Converged))?;
        writeln!(f, "  Not converged: {}", self.count(DriftStatus::NotConverged))?;
        writeln!(f, "  Failed: {}", self.count(DriftStatus::Failed))?;

        let errors: Vec<_> = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| (o, e)))
            .collect();
        if !errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for (outcome, error) in errors {
                writeln!(f, "    - {} '{}': {error}", outcome.kind, outcome.key)?;
            }
        }

        Ok(())
    }
}

type Outcome = Result<(DriftStatus, ComparisonResult)>;
type Recorded<'a> = std::result::Result<(DriftStatus, &'a ComparisonResult), &'a ConvergentError>;

fn recorded(outcome: &Outcome) -> Recorded<'_> {
    outcome.as_ref().map(|(status, differences)| (*status, differences))
}

/// Drives resources on one agent towards their templates.
pub struct Reconciler<C: AgentChannel> {
    client: JobClient<C>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    store: Option<Arc<dyn StateStore>>,
    record_lock: Mutex<()>,
    sink: Arc<dyn LogSink>,
    hasher: TemplateHasher,
}

impl<C: AgentChannel> Reconciler<C> {
    /// Creates a reconciler that forwards agent events to `tracing`.
    #[must_use]
    pub fn new(channel: C) -> Self {
        Self {
            client: JobClient::new(channel),
            credentials: None,
            store: None,
            record_lock: Mutex::new(()),
            sink: Arc::new(TracingLogSink),
            hasher: TemplateHasher::new(),
        }
    }

    /// Sets the resolver for credential names.
    #[must_use]
    pub fn with_credentials(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(resolver);
        self
    }

    /// Records drift status in `store` after every operation.
    #[must_use]
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sends agent log events to `sink` instead of `tracing`.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Reads the actual state of the resource `template` identifies.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTemplate` before anything is sent, `Cancelled`, or
    /// whatever the agent reports.
    pub async fn collect<R: Resource>(&self, template: &R, cancel: &CancellationSignal) -> Result<R> {
        template.validate()?;
        debug!("Collecting {}", template.describe());
        self.submit(
            &CollectJob {
                template: template.clone(),
            },
            cancel,
        )
        .await
    }

    /// Collects and compares, without changing anything.
    ///
    /// # Errors
    ///
    /// Same as [`Self::collect`], plus `CredentialNotFound`.
    pub async fn test<R: Resource>(
        &self,
        template: &R,
        cancel: &CancellationSignal,
    ) -> Result<ComparisonResult> {
        let outcome = self.test_outcome(template, cancel).await;
        self.record(template, recorded(&outcome)).await;
        outcome.map(|(_, differences)| differences)
    }

    /// Brings the resource into the state `template` describes.
    ///
    /// Returns the drift found before configuring; an empty result means
    /// nothing was changed. In simulation the agent only logs what it would
    /// do.
    ///
    /// # Errors
    ///
    /// Same as [`Self::test`], plus the adapter's `ResourceMissing` or
    /// `ConfigureFailed`.
    pub async fn ensure<R: Resource>(
        &self,
        template: &R,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Result<ComparisonResult> {
        let outcome = self.ensure_outcome(template, simulation, cancel).await;
        self.record(template, recorded(&outcome)).await;
        outcome.map(|(_, differences)| differences)
    }

    /// Like [`Self::ensure`], but the agent collects, compares, configures
    /// and re-collects itself.
    ///
    /// # Errors
    ///
    /// Same as [`Self::ensure`].
    pub async fn ensure_on_agent<R: Resource>(
        &self,
        template: &R,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Result<EnsureReport> {
        let report = self.ensure_on_agent_report(template, simulation, cancel).await;
        self.record(template, report.as_ref().map(|r| (report_status(r), &r.differences)))
            .await;
        report
    }

    /// [`Self::collect`] for a template of any kind.
    ///
    /// # Errors
    ///
    /// Same as [`Self::collect`].
    pub async fn collect_any(
        &self,
        template: &AnyTemplate,
        cancel: &CancellationSignal,
    ) -> Result<AnyTemplate> {
        with_template!(template, t => self.collect(t, cancel).await.map(Resource::into_any))
    }

    /// [`Self::test`] for a template of any kind.
    ///
    /// # Errors
    ///
    /// Same as [`Self::test`].
    pub async fn test_any(
        &self,
        template: &AnyTemplate,
        cancel: &CancellationSignal,
    ) -> Result<ComparisonResult> {
        with_template!(template, t => self.test(t, cancel).await)
    }

    /// [`Self::ensure`] for a template of any kind.
    ///
    /// # Errors
    ///
    /// Same as [`Self::ensure`].
    pub async fn ensure_any(
        &self,
        template: &AnyTemplate,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Result<ComparisonResult> {
        with_template!(template, t => self.ensure(t, simulation, cancel).await)
    }

    /// [`Self::ensure_on_agent`] for a template of any kind.
    ///
    /// # Errors
    ///
    /// Same as [`Self::ensure_on_agent`].
    pub async fn ensure_on_agent_any(
        &self,
        template: &AnyTemplate,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Result<EnsureReport> {
        with_template!(template, t => self.ensure_on_agent(t, simulation, cancel).await)
    }

    /// Runs every template in order.
    ///
    /// A failing resource is recorded and the run moves on. The run stops
    /// on cancellation or when the agent cannot be reached.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or the transport error that stopped the run.
    pub async fn reconcile_all(
        &self,
        templates: &[AnyTemplate],
        mode: ReconcileMode,
        cancel: &CancellationSignal,
    ) -> Result<ReconciliationResult> {
        info!("Reconciling {} resource(s)", templates.len());
        let mut result = ReconciliationResult::default();

        for template in templates {
            cancel.checkpoint()?;

            let outcome = with_template!(template, t => self.run_mode(t, mode, cancel).await);
            let entry = match outcome {
                Ok((status, differences)) => ResourceOutcome {
                    kind: template.kind(),
                    key: template.configuration_key(),
                    status,
                    differences,
                    error: None,
                },
                Err(e) if e.is_cancelled() || e.is_transport() => return Err(e),
                Err(e) => {
                    warn!("{} failed: {e}", template.describe());
                    ResourceOutcome {
                        kind: template.kind(),
                        key: template.configuration_key(),
                        status: DriftStatus::Failed,
                        differences: ComparisonResult::default(),
                        error: Some(e.to_string()),
                    }
                }
            };
            result.outcomes.push(entry);
        }

        info!(
            "Reconciliation finished: {} failed, {} drifted",
            result.count(DriftStatus::Failed),
            result.count(DriftStatus::Drifted)
        );
        Ok(result)
    }

    /// Runs a script on the agent, attaching the named credential first.
    ///
    /// # Errors
    ///
    /// Returns `CredentialNotFound`, `ScriptNonZeroExit`, `Cancelled`, or a
    /// transport error.
    pub async fn run_script(
        &self,
        mut script: ScriptJob,
        credential: Option<&str>,
        cancel: &CancellationSignal,
    ) -> Result<ScriptResult> {
        if let Some(name) = credential {
            script.credential = Some(self.resolve(name).await?);
        }
        self.submit(&script, cancel).await
    }

    /// Runs a script as written in the configuration file.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run_script`].
    pub async fn run_definition(
        &self,
        definition: &ScriptDefinition,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Result<ScriptResult> {
        self.run_script(
            definition.to_job(simulation),
            definition.credential.as_deref(),
            cancel,
        )
        .await
    }

    async fn run_mode<R: Resource>(
        &self,
        template: &R,
        mode: ReconcileMode,
        cancel: &CancellationSignal,
    ) -> Outcome {
        let outcome = match mode {
            ReconcileMode::Test => self.test_outcome(template, cancel).await,
            ReconcileMode::Ensure { simulation } => {
                self.ensure_outcome(template, simulation, cancel).await
            }
            ReconcileMode::EnsureOnAgent { simulation } => self
                .ensure_on_agent_report(template, simulation, cancel)
                .await
                .map(|r| (report_status(&r), r.differences)),
        };
        self.record(template, recorded(&outcome)).await;
        outcome
    }

    async fn test_outcome<R: Resource>(&self, template: &R, cancel: &CancellationSignal) -> Outcome {
        let desired = self.prepare(template).await?;
        let actual = self.submit(&CollectJob { template: desired.clone() }, cancel).await?;
        let differences = compare(&desired, &actual);

        if differences.are_equal() {
            info!("{} is in the desired state", desired.describe());
            Ok((DriftStatus::InDesiredState, differences))
        } else {
            info!("{} has drifted: {differences}", desired.describe());
            Ok((DriftStatus::Drifted, differences))
        }
    }

    async fn ensure_outcome<R: Resource>(
        &self,
        template: &R,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Outcome {
        let desired = self.prepare(template).await?;
        let description = desired.describe();

        let actual = self.submit(&CollectJob { template: desired.clone() }, cancel).await?;
        let differences = compare(&desired, &actual);
        if differences.are_equal() {
            info!("{description} is in the desired state");
            return Ok((DriftStatus::InDesiredState, differences));
        }

        for difference in &differences {
            info!("{description}: {difference}");
        }

        let receipt = self
            .submit(
                &ConfigureJob {
                    template: desired.clone(),
                    simulation,
                },
                cancel,
            )
            .await?;
        if receipt.simulated {
            info!("[simulation] {description} left unchanged");
            return Ok((DriftStatus::Drifted, differences));
        }

        let after = self.submit(&CollectJob { template: desired.clone() }, cancel).await?;
        let remaining = compare(&desired, &after);
        if remaining.are_equal() {
            info!("{description} converged");
            Ok((DriftStatus::Converged, differences))
        } else {
            warn!("{description} did not converge after configure: {remaining}");
            Ok((DriftStatus::NotConverged, differences))
        }
    }

    async fn ensure_on_agent_report<R: Resource>(
        &self,
        template: &R,
        simulation: bool,
        cancel: &CancellationSignal,
    ) -> Result<EnsureReport> {
        let desired = self.prepare(template).await?;
        let description = desired.describe();
        let report = self
            .submit(
                &EnsureJob {
                    template: desired,
                    simulation,
                },
                cancel,
            )
            .await?;

        match report_status(&report) {
            DriftStatus::NotConverged => {
                warn!("{description} did not converge after configure");
            }
            status => info!("{description}: {status}"),
        }
        Ok(report)
    }

    /// Validates locally and attaches the credential the template names.
    async fn prepare<R: Resource>(&self, template: &R) -> Result<R> {
        template.validate()?;

        let mut prepared = template.clone();
        if let Some(name) = template.credential_name() {
            prepared.attach_credential(self.resolve(name).await?);
        }
        Ok(prepared)
    }

    async fn resolve(&self, name: &str) -> Result<Credential> {
        let resolver = self.credentials.as_ref().ok_or_else(|| CredentialError::NotFound {
            name: name.to_string(),
        })?;
        debug!("Resolving credential '{name}'");
        resolver.resolve(name).await
    }

    async fn submit<J: Job>(&self, job: &J, cancel: &CancellationSignal) -> Result<J::Output> {
        let (monitor, _subscription) = JobMonitor::new();
        let monitor = monitor.with_sink(Arc::clone(&self.sink));
        self.client.submit(job, cancel, &monitor).await
    }

    async fn record<R: Resource>(&self, template: &R, outcome: Recorded<'_>) {
        let Some(store) = &self.store else {
            return;
        };

        let (status, differences, error) = match outcome {
            Ok((status, differences)) => (status, differences.differences.clone(), None),
            Err(e) if e.is_cancelled() => return,
            Err(e) => (DriftStatus::Failed, Vec::new(), Some(e.to_string())),
        };

        let fingerprint = self.hasher.fingerprint(template).unwrap_or_else(|e| {
            warn!("Could not fingerprint {}: {e}", template.describe());
            String::new()
        });

        let mut record = DriftRecord::new(R::KIND, template.configuration_key(), status, fingerprint)
            .with_differences(differences);
        if let Some(error) = error {
            record = record.with_error(error);
        }

        let _guard = self.record_lock.lock().await;
        if let Err(e) = store.record(record).await {
            warn!("Could not record drift status of {}: {e}", template.describe());
        }
    }
}

impl<C: AgentChannel> std::fmt::Debug for Reconciler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("channel", &self.client.channel().describe())
            .field("credentials", &self.credentials.is_some())
            .field("state_store", &self.store.as_ref().map(|s| s.backend_type()))
            .finish_non_exhaustive()
    }
}

const fn report_status(report: &EnsureReport) -> DriftStatus {
    match (report.configured, report.converged) {
        (false, _) if report.differences.differences.is_empty() => DriftStatus::InDesiredState,
        (false, _) => DriftStatus::Drifted,
        (true, Some(true)) => DriftStatus::Converged,
        (true, _) => DriftStatus::NotConverged,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::credential::{MockCredentialResolver, SecretBuffer};
    use crate::error::{AdapterError, ChannelError, ScriptError, TemplateError};
    use crate::job::{
        Agent, AgentResources, DuplexConnector, LocalChannel, PollPolicy, StreamChannel,
    };
    use crate::resource::{
        FirewallRule, MemoryHost, Protocol, RegistryKey, RegistryValue, RegistryValueKind, Service,
        ServiceState, SiteState, StartMode, VirtualDirectory, WebApplication, WebSite,
    };
    use crate::script::ProcessScriptHost;
    use crate::state::LocalStateStore;

    fn agent(host: &Arc<MemoryHost>, start_delay_polls: u32, policy: PollPolicy) -> Arc<Agent> {
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()))
            .with_adapters(host.adapters(start_delay_polls))
            .with_poll_policy(policy);
        Arc::new(Agent::with_builtin_jobs(resources))
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), 20)
    }

    fn local(host: &Arc<MemoryHost>) -> Reconciler<LocalChannel> {
        Reconciler::new(LocalChannel::new(agent(host, 2, fast_policy())))
    }

    fn remote(host: &Arc<MemoryHost>) -> Reconciler<StreamChannel<DuplexConnector>> {
        Reconciler::new(StreamChannel::new(DuplexConnector::new(agent(
            host,
            2,
            fast_policy(),
        ))))
    }

    fn spooler(start_mode: StartMode) -> Service {
        Service {
            start_mode: Some(start_mode),
            state: Some(ServiceState::Running),
            ..Service::named("Spooler")
        }
    }

    fn seeded_spooler() -> Arc<MemoryHost> {
        let host = MemoryHost::new();
        host.seed(&AnyTemplate::Service(spooler(StartMode::Manual)))
            .expect("seed");
        host
    }

    fn images(credential_name: Option<&str>) -> VirtualDirectory {
        VirtualDirectory {
            site: String::from("Shop"),
            application: String::from("/"),
            path: String::from("images"),
            exists: true,
            physical_path: Some(String::from("\\\\files\\images")),
            credential_name: credential_name.map(String::from),
            credential: None,
        }
    }

    fn full_inventory() -> Vec<AnyTemplate> {
        vec![
            AnyTemplate::WebSite(WebSite {
                state: Some(SiteState::Started),
                physical_path: Some(String::from("C:\\inetpub\\shop")),
                bindings: Some(vec![String::from("http/*:80:")]),
                ..WebSite::named("Shop")
            }),
            AnyTemplate::WebApplication(WebApplication {
                site: String::from("Shop"),
                path: String::from("/api"),
                exists: true,
                physical_path: Some(String::from("C:\\inetpub\\shop-api")),
                application_pool: Some(String::from("ShopApi")),
            }),
            AnyTemplate::VirtualDirectory(images(None)),
            AnyTemplate::RegistryKey(RegistryKey::at("HKLM\\Software\\Acme")),
            AnyTemplate::RegistryValue(RegistryValue {
                path: String::from("HKLM\\Software\\Acme"),
                name: String::from("Mode"),
                exists: true,
                value_kind: Some(RegistryValueKind::String),
                data: Some(vec![String::from("production")]),
            }),
            AnyTemplate::FirewallRule(FirewallRule {
                protocol: Some(Protocol::Tcp),
                local_ports: Some(String::from("80-81,443")),
                ..FirewallRule::named("Web")
            }),
            AnyTemplate::Service(spooler(StartMode::Automatic)),
        ]
    }

    #[tokio::test]
    async fn test_drifted_start_mode_is_configured_once() {
        let host = seeded_spooler();
        let reconciler = local(&host);
        let cancel = CancellationSignal::new();
        let desired = spooler(StartMode::Automatic);

        let drift = reconciler.test(&desired, &cancel).await.expect("test");
        assert_eq!(drift.len(), 1);
        assert!(drift.field("StartMode").is_some());

        let fixed = reconciler.ensure(&desired, false, &cancel).await.expect("ensure");
        assert_eq!(fixed.len(), 1);
        assert_eq!(host.configure_calls(ResourceKind::Service), 1);

        let after = reconciler.test(&desired, &cancel).await.expect("test");
        assert!(after.are_equal());
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let host = seeded_spooler();
        let reconciler = remote(&host);
        let cancel = CancellationSignal::new();
        let desired = spooler(StartMode::Automatic);

        assert!(!reconciler.ensure(&desired, false, &cancel).await.expect("first").are_equal());
        assert!(reconciler.ensure(&desired, false, &cancel).await.expect("second").are_equal());
        assert_eq!(host.configure_calls(ResourceKind::Service), 1);
    }

    #[tokio::test]
    async fn test_removing_absent_resource_does_nothing() {
        let host = MemoryHost::new();
        let reconciler = local(&host);
        let gone = Service {
            exists: false,
            ..Service::named("Telnet")
        };

        let result = assert_ok!(reconciler.ensure(&gone, false, &CancellationSignal::new()).await);

        assert!(result.are_equal());
        assert_eq!(host.configure_calls(ResourceKind::Service), 0);
    }

    #[tokio::test]
    async fn test_port_ranges_compare_as_sets() {
        let host = MemoryHost::new();
        host.seed(&AnyTemplate::FirewallRule(FirewallRule {
            protocol: Some(Protocol::Tcp),
            local_ports: Some(String::from("443,81,80")),
            ..FirewallRule::named("Web")
        }))
        .expect("seed");
        let desired = FirewallRule {
            protocol: Some(Protocol::Tcp),
            local_ports: Some(String::from("80-81,443")),
            ..FirewallRule::named("Web")
        };

        let result = local(&host)
            .test(&desired, &CancellationSignal::new())
            .await
            .expect("test");
        assert!(result.are_equal());
    }

    #[tokio::test]
    async fn test_simulation_changes_nothing() {
        let host = seeded_spooler();
        let reconciler = local(&host);
        let desired = spooler(StartMode::Automatic);

        let drift = reconciler
            .ensure(&desired, true, &CancellationSignal::new())
            .await
            .expect("ensure");

        assert_eq!(drift.len(), 1);
        let actual: Service = host.get("spooler").expect("get").expect("present");
        assert_eq!(actual.start_mode, Some(StartMode::Manual));
    }

    #[tokio::test]
    async fn test_ensure_on_agent_reports_convergence() {
        let host = seeded_spooler();
        let reconciler = remote(&host);
        let desired = spooler(StartMode::Automatic);

        let report = reconciler
            .ensure_on_agent(&desired, false, &CancellationSignal::new())
            .await
            .expect("ensure");

        assert!(report.configured);
        assert_eq!(report.converged, Some(true));
        assert_eq!(report.differences.len(), 1);
        assert_eq!(report_status(&report), DriftStatus::Converged);
    }

    #[tokio::test]
    async fn test_invalid_template_never_reaches_agent() {
        let host = MemoryHost::new();
        let reconciler = local(&host);

        let err = reconciler
            .ensure(&Service::named(" "), false, &CancellationSignal::new())
            .await
            .expect_err("invalid");

        assert!(matches!(err, ConvergentError::Template(TemplateError::InvalidField { .. })));
        assert_eq!(host.configure_calls(ResourceKind::Service), 0);
    }

    #[tokio::test]
    async fn test_missing_parent_fails_creation() {
        let host = MemoryHost::new();
        let err = remote(&host)
            .ensure(&images(None), false, &CancellationSignal::new())
            .await
            .expect_err("missing site");

        assert!(matches!(err, ConvergentError::Adapter(AdapterError::ResourceMissing { .. })));
    }

    #[tokio::test]
    async fn test_every_kind_round_trips_over_a_stream() {
        let host = MemoryHost::new();
        let reconciler = remote(&host);
        let cancel = CancellationSignal::new();
        let inventory = full_inventory();

        let ensured = reconciler
            .reconcile_all(&inventory, ReconcileMode::Ensure { simulation: false }, &cancel)
            .await
            .expect("ensure");
        assert!(ensured.success(), "{ensured}");
        assert_eq!(ensured.count(DriftStatus::Converged), inventory.len());

        let tested = reconciler
            .reconcile_all(&inventory, ReconcileMode::Test, &cancel)
            .await
            .expect("test");
        assert!(!tested.has_drift(), "{tested}");
        assert_eq!(tested.count(DriftStatus::InDesiredState), inventory.len());

        for template in &inventory {
            let actual = reconciler.collect_any(template, &cancel).await.expect("collect");
            assert_eq!(actual.kind(), template.kind());
            assert!(actual.exists());
        }
    }

    #[tokio::test]
    async fn test_reconcile_all_continues_after_failure() {
        let host = MemoryHost::new();
        let reconciler = local(&host);
        let templates = vec![
            AnyTemplate::VirtualDirectory(images(None)),
            AnyTemplate::RegistryKey(RegistryKey::at("HKLM\\Software\\Acme")),
        ];

        let result = reconciler
            .reconcile_all(
                &templates,
                ReconcileMode::EnsureOnAgent { simulation: false },
                &CancellationSignal::new(),
            )
            .await
            .expect("run");

        assert!(!result.success());
        assert_eq!(result.outcomes[0].status, DriftStatus::Failed);
        assert!(result.outcomes[0].error.is_some());
        assert_eq!(result.outcomes[1].status, DriftStatus::Converged);
        assert!(result.to_string().contains("Failed: 1"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_start_that_never_completes() {
        let host = MemoryHost::new();
        host.seed(&AnyTemplate::Service(Service {
            state: Some(ServiceState::Stopped),
            ..Service::named("Slow")
        }))
        .expect("seed");
        let reconciler = Reconciler::new(LocalChannel::new(agent(
            &host,
            u32::MAX,
            PollPolicy::new(Duration::from_millis(5), u32::MAX),
        )));
        let desired = Service {
            state: Some(ServiceState::Running),
            ..Service::named("Slow")
        };

        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            reconciler.ensure(&desired, false, &cancel),
        )
        .await
        .expect("bounded")
        .expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_credential_is_resolved_before_submission() {
        let host = MemoryHost::new();
        host.seed(&AnyTemplate::WebSite(WebSite::named("Shop")))
            .expect("seed");

        let mut resolver = MockCredentialResolver::new();
        resolver
            .expect_resolve()
            .withf(|name: &str| name == "content-share")
            .times(1)
            .returning(|_| Ok(Credential::new("svc-content", SecretBuffer::from("pw"))));
        let reconciler = local(&host).with_credentials(Arc::new(resolver));

        reconciler
            .ensure(&images(Some("content-share")), false, &CancellationSignal::new())
            .await
            .expect("ensure");

        let actual: VirtualDirectory = host.get("shop/images").expect("get").expect("present");
        assert_eq!(actual.credential.map(|c| c.username), Some(String::from("svc-content")));
    }

    #[tokio::test]
    async fn test_unresolvable_credential_fails_locally() {
        let host = MemoryHost::new();
        let err = assert_err!(
            local(&host)
                .test(&images(Some("content-share")), &CancellationSignal::new())
                .await
        );

        assert!(matches!(err, ConvergentError::Credential(CredentialError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_drift_status_is_recorded() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let host = seeded_spooler();
        let reconciler = local(&host).with_state_store(Arc::clone(&store) as Arc<dyn StateStore>);
        let cancel = CancellationSignal::new();

        reconciler
            .ensure(&spooler(StartMode::Automatic), false, &cancel)
            .await
            .expect("ensure");
        let _ = reconciler.ensure(&images(None), false, &cancel).await;

        let state = store.load().await.expect("load").expect("state");
        let spooler_record = state.get(ResourceKind::Service, "spooler").expect("recorded");
        assert_eq!(spooler_record.status, DriftStatus::Converged);
        assert_eq!(spooler_record.differences.len(), 1);
        assert_eq!(spooler_record.fingerprint.len(), 64);

        let failed = state
            .get(ResourceKind::VirtualDirectory, "shop/images")
            .expect("recorded");
        assert_eq!(failed.status, DriftStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_reconciliations() {
        let host = MemoryHost::new();
        let reconciler = remote(&host);
        let cancel = CancellationSignal::new();
        let first = Service::named("Alpha");
        let second = Service::named("Beta");

        let (a, b) = tokio::join!(
            reconciler.ensure(&first, false, &cancel),
            reconciler.ensure(&second, false, &cancel)
        );

        assert_eq!(a.expect("alpha").len(), 1);
        assert_eq!(b.expect("beta").len(), 1);
        assert_eq!(host.configure_calls(ResourceKind::Service), 2);
    }

    #[tokio::test]
    async fn test_script_round_trip() {
        let host = MemoryHost::new();
        let reconciler = remote(&host);
        let script = ScriptJob::new("echo \"OUTPUT:$GREETING\"")
            .with_variable("GREETING", "hello")
            .collecting_output();

        let result = reconciler
            .run_script(script, None, &CancellationSignal::new())
            .await
            .expect("run");

        assert_eq!(result.outputs, vec![String::from("hello")]);
    }

    #[tokio::test]
    async fn test_script_failure_carries_exit_code() {
        let host = MemoryHost::new();
        let err = local(&host)
            .run_script(ScriptJob::new("exit 3"), None, &CancellationSignal::new())
            .await
            .expect_err("nonzero");

        assert!(matches!(
            err,
            ConvergentError::Script(ScriptError::NonZeroExit { exit_code: 3 })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_submission() {
        let host = MemoryHost::new();
        let cancel = CancellationSignal::new();
        cancel.cancel();

        let err = local(&host)
            .collect(&Service::named("Spooler"), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, ConvergentError::Channel(ChannelError::Cancelled)));
    }
}
