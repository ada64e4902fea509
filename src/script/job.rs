use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::error::{Result, ScriptError};
use crate::job::wire::wire_record;
use crate::job::{Job, JobContext};

/// A name/value pair bound into the script's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptVariable {
    /// Environment variable name.
    pub name: String,
    /// Value.
    pub value: String,
}

wire_record!(ScriptVariable { name, value });

/// Runs a script on the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptJob {
    /// Forward `DEBUG:` lines.
    pub include_debug: bool,
    /// Forward `VERBOSE:` lines.
    pub include_verbose: bool,
    /// Return `OUTPUT:` values as the result instead of logging them.
    pub collect_output: bool,
    /// The caller is in simulation mode.
    pub simulation: bool,
    /// Run the script even in simulation mode.
    pub run_in_simulation: bool,
    /// Script text.
    pub body: String,
    /// Environment bindings.
    pub variables: Vec<ScriptVariable>,
    /// Credential handed to the script.
    pub credential: Option<Credential>,
}

wire_record!(ScriptJob {
    include_debug,
    include_verbose,
    collect_output,
    simulation,
    run_in_simulation,
    body,
    variables,
    credential,
});

/// Result of a [`ScriptJob`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptResult {
    /// True when the script was not run because of simulation.
    pub skipped: bool,
    /// Interpreter exit code.
    pub exit_code: i32,
    /// `OUTPUT:` values in emission order, when collected.
    pub outputs: Vec<String>,
}

wire_record!(ScriptResult {
    skipped,
    exit_code,
    outputs,
});

impl ScriptJob {
    /// Creates a job for `body` with every flag off.
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            include_debug: false,
            include_verbose: false,
            collect_output: false,
            simulation: false,
            run_in_simulation: false,
            body: body.into(),
            variables: Vec::new(),
            credential: None,
        }
    }

    /// Adds an environment binding.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push(ScriptVariable {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Collects `OUTPUT:` values as the result.
    #[must_use]
    pub const fn collecting_output(mut self) -> Self {
        self.collect_output = true;
        self
    }

    /// Attaches a credential.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

#[async_trait]
impl Job for ScriptJob {
    type Output = ScriptResult;

    fn kind() -> String {
        String::from("script.run")
    }

    async fn execute(&self, ctx: &JobContext) -> Result<ScriptResult> {
        ctx.checkpoint()?;

        if self.simulation && !self.run_in_simulation {
            ctx.events()
                .info("[simulation] Script not executed; enable run_in_simulation to run it");
            return Ok(ScriptResult {
                skipped: true,
                ..ScriptResult::default()
            });
        }

        let result = ctx.script_host().run(self, ctx).await?;
        if result.exit_code != 0 {
            return Err(ScriptError::NonZeroExit {
                exit_code: result.exit_code,
            }
            .into());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::SecretBuffer;
    use crate::job::wire::{from_bytes, to_bytes};
    use crate::job::{AgentResources, CancellationSignal, EventEmitter};
    use crate::script::ProcessScriptHost;
    use std::sync::Arc;

    fn context() -> JobContext {
        JobContext::new(
            Arc::new(AgentResources::new(Arc::new(ProcessScriptHost::default()))),
            CancellationSignal::new(),
            EventEmitter::discard(),
        )
    }

    #[test]
    fn test_flags_lead_the_payload() {
        let job = ScriptJob {
            include_verbose: true,
            run_in_simulation: true,
            ..ScriptJob::new("echo hi")
        };
        let bytes = to_bytes(&job).expect("encode");
        assert_eq!(&bytes[..5], &[0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_round_trip_with_credential_and_empties() {
        let job = ScriptJob::new("")
            .with_variable("EMPTY", "")
            .with_credential(Credential::new("svc-deploy", SecretBuffer::from("pa55")));
        let decoded: ScriptJob = from_bytes(&to_bytes(&job).expect("encode")).expect("decode");
        assert_eq!(decoded, job);
    }

    #[tokio::test]
    async fn test_simulation_skips_the_script() {
        let job = ScriptJob {
            simulation: true,
            ..ScriptJob::new("exit 3")
        };
        let result = job.execute(&context()).await.expect("skipped");
        assert!(result.skipped);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_the_job() {
        let err = ScriptJob::new("echo 'ERROR: broken' ; exit 3")
            .execute(&context())
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            crate::error::ConvergentError::Script(ScriptError::NonZeroExit { exit_code: 3 })
        ));
    }

    #[tokio::test]
    async fn test_run_in_simulation_runs() {
        let job = ScriptJob {
            simulation: true,
            run_in_simulation: true,
            ..ScriptJob::new("echo 'OUTPUT: ran'").collecting_output()
        };
        let result = job.execute(&context()).await.expect("run");
        assert!(!result.skipped);
        assert_eq!(result.outputs, vec!["ran"]);
    }
}
