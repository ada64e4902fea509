//! Collect, configure and ensure jobs, generic over the resource kind.

use async_trait::async_trait;

use crate::compare::{compare, ComparisonResult};
use crate::error::{AdapterError, ChannelError, ConvergentError, Result, WireError};
use crate::job::wire::{wire_record, Wire, WireReader, WireWriter};
use crate::job::{Job, JobContext};

use super::template::Resource;

/// Reads the actual state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectJob<R> {
    /// The resource to read.
    pub template: R,
}

/// Applies a template.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureJob<R> {
    /// Desired state.
    pub template: R,
    /// Log what would change without changing anything.
    pub simulation: bool,
}

/// Collects, compares and, on drift, configures and re-collects, all in one
/// round trip to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureJob<R> {
    /// Desired state.
    pub template: R,
    /// Log what would change without changing anything.
    pub simulation: bool,
}

/// Result of a [`ConfigureJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureReceipt {
    /// True if nothing was changed because of simulation.
    pub simulated: bool,
}

wire_record!(ConfigureReceipt { simulated });

/// Result of an [`EnsureJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureReport {
    /// Whether configure ran.
    pub configured: bool,
    /// Outcome of the confirming re-collect; `None` when it did not run.
    pub converged: Option<bool>,
    /// Drift found before configuring.
    pub differences: ComparisonResult,
}

wire_record!(EnsureReport {
    configured,
    converged,
    differences,
});

impl<R: Resource> Wire for CollectJob<R> {
    fn encode(&self, writer: &mut WireWriter) {
        self.template.encode(writer);
    }

    fn decode(reader: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        Ok(Self {
            template: R::decode(reader)?,
        })
    }
}

impl<R: Resource> Wire for ConfigureJob<R> {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_bool(self.simulation);
        self.template.encode(writer);
    }

    fn decode(reader: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        let simulation = reader.get_bool()?;
        Ok(Self {
            template: R::decode(reader)?,
            simulation,
        })
    }
}

impl<R: Resource> Wire for EnsureJob<R> {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_bool(self.simulation);
        self.template.encode(writer);
    }

    fn decode(reader: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        let simulation = reader.get_bool()?;
        Ok(Self {
            template: R::decode(reader)?,
            simulation,
        })
    }
}

/// Keeps taxonomy errors and wraps anything else as `ConfigureFailed`.
fn configure_error<R: Resource>(template: &R, error: ConvergentError) -> ConvergentError {
    match error {
        ConvergentError::Template(_)
        | ConvergentError::Channel(ChannelError::Cancelled | ChannelError::AdapterUnavailable { .. })
        | ConvergentError::Adapter(_) => error,
        other => AdapterError::configure_failed(
            R::KIND.type_name(),
            template.configuration_key(),
            other.to_string(),
        )
        .into(),
    }
}

/// Runs configure and applies the simulation rule: a simulated configure
/// never surfaces `ConfigureFailed`.
async fn run_configure<R: Resource>(template: &R, simulation: bool, ctx: &JobContext) -> Result<()> {
    let adapter = ctx.adapter::<R>()?;
    match adapter.configure(template, simulation, ctx).await {
        Ok(()) => Ok(()),
        Err(e) => match configure_error(template, e) {
            ConvergentError::Adapter(AdapterError::ConfigureFailed { reason, .. }) if simulation => {
                ctx.events().warn(format!(
                    "[simulation] {} would fail to configure: {}",
                    template.describe(),
                    reason
                ));
                Ok(())
            }
            e => Err(e),
        },
    }
}

#[async_trait]
impl<R: Resource> Job for CollectJob<R> {
    type Output = R;

    fn kind() -> String {
        format!("{}.collect", R::KIND.type_name())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<R> {
        ctx.checkpoint()?;
        self.template.validate()?;
        let adapter = ctx.adapter::<R>()?;

        ctx.events().debug(format!("Collecting {}", self.template.describe()));
        adapter.collect(&self.template, ctx).await
    }
}

#[async_trait]
impl<R: Resource> Job for ConfigureJob<R> {
    type Output = ConfigureReceipt;

    fn kind() -> String {
        format!("{}.configure", R::KIND.type_name())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<ConfigureReceipt> {
        ctx.checkpoint()?;
        self.template.validate()?;

        ctx.events().info(format!(
            "{}Configuring {}",
            if self.simulation { "[simulation] " } else { "" },
            self.template.describe()
        ));
        run_configure(&self.template, self.simulation, ctx).await?;
        Ok(ConfigureReceipt {
            simulated: self.simulation,
        })
    }
}

#[async_trait]
impl<R: Resource> Job for EnsureJob<R> {
    type Output = EnsureReport;

    fn kind() -> String {
        format!("{}.ensure", R::KIND.type_name())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<EnsureReport> {
        ctx.checkpoint()?;
        self.template.validate()?;
        let adapter = ctx.adapter::<R>()?;
        let description = self.template.describe();

        ctx.events().progress(Some(0), Some(format!("Collecting {description}")));
        let actual = adapter.collect(&self.template, ctx).await?;
        let differences = compare(&self.template, &actual);

        if differences.are_equal() {
            ctx.events().info(format!("{description} is in the desired state"));
            ctx.events().progress(Some(100), None);
            return Ok(EnsureReport {
                configured: false,
                converged: None,
                differences,
            });
        }

        for difference in &differences {
            ctx.events().info(format!("{description} drift: {difference}"));
        }

        ctx.checkpoint()?;
        ctx.events().progress(Some(33), Some(format!("Configuring {description}")));
        run_configure(&self.template, self.simulation, ctx).await?;
        if self.simulation {
            ctx.events().progress(Some(100), None);
            return Ok(EnsureReport {
                configured: false,
                converged: None,
                differences,
            });
        }

        ctx.checkpoint()?;
        ctx.events().progress(Some(66), Some(format!("Confirming {description}")));
        let after = adapter.collect(&self.template, ctx).await?;
        let remaining = compare(&self.template, &after);
        if !remaining.are_equal() {
            ctx.events().warn(format!(
                "{description} did not converge after configure: {remaining}"
            ));
        }
        ctx.events().progress(Some(100), None);

        Ok(EnsureReport {
            configured: true,
            converged: Some(remaining.are_equal()),
            differences,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::wire::{from_bytes, to_bytes};
    use crate::resource::{FirewallRule, RegistryValue, RegistryValueKind, Service, StartMode};

    #[test]
    fn test_job_kinds() {
        assert_eq!(CollectJob::<Service>::kind(), "service.collect");
        assert_eq!(ConfigureJob::<FirewallRule>::kind(), "firewall.rule.configure");
        assert_eq!(EnsureJob::<RegistryValue>::kind(), "registry.value.ensure");
    }

    #[test]
    fn test_configure_job_header_comes_first() {
        let job = ConfigureJob {
            template: Service::named("Spooler"),
            simulation: true,
        };
        let bytes = to_bytes(&job).expect("encode");

        // simulation flag, then the template's exists flag
        assert_eq!(&bytes[..2], &[1, 1]);
    }

    #[test]
    fn test_jobs_survive_empty_and_absent_fields() {
        let job = EnsureJob {
            template: RegistryValue {
                path: String::from("HKLM\\Software\\Acme"),
                name: String::new(),
                exists: true,
                value_kind: Some(RegistryValueKind::MultiString),
                data: Some(vec![]),
            },
            simulation: false,
        };
        let decoded: EnsureJob<RegistryValue> =
            from_bytes(&to_bytes(&job).expect("encode")).expect("decode");
        assert_eq!(decoded, job);

        let job = CollectJob {
            template: Service {
                start_mode: Some(StartMode::Disabled),
                dependencies: Some(vec![String::new()]),
                ..Service::named("")
            },
        };
        let decoded: CollectJob<Service> = from_bytes(&to_bytes(&job).expect("encode")).expect("decode");
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_unclassified_configure_errors_are_wrapped() {
        let template = Service::named("Spooler");
        let wrapped = configure_error(&template, ConvergentError::internal("access denied"));
        assert!(matches!(
            wrapped,
            ConvergentError::Adapter(AdapterError::ConfigureFailed { .. })
        ));

        let cancelled = configure_error(&template, ConvergentError::Channel(ChannelError::Cancelled));
        assert!(cancelled.is_cancelled());
    }
}
