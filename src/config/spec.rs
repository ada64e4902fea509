//! Types that map to `convergent.yaml`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::job::PollPolicy;
use crate::resource::AnyTemplate;
use crate::script::ScriptJob;

/// Default agent address.
pub const DEFAULT_AGENT_ADDRESS: &str = "127.0.0.1:7390";

/// Root of a run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    /// How to reach the agent.
    #[serde(default)]
    pub agent: AgentSettings,
    /// Drift status persistence.
    #[serde(default)]
    pub state: StateSettings,
    /// Desired resource states.
    #[serde(default)]
    pub resources: Vec<AnyTemplate>,
    /// Named scripts.
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptDefinition>,
}

/// Agent connection and job timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct AgentSettings {
    /// `host:port` the agent listens on.
    #[serde(default = "default_address")]
    #[validate(length(min = 1, message = "Agent address cannot be empty"))]
    pub address: String,
    /// Seconds to wait for a connection.
    #[serde(default = "default_connect_timeout")]
    #[validate(range(min = 1, max = 300, message = "Connect timeout must be between 1 and 300 seconds"))]
    pub connect_timeout_secs: u64,
    /// Seconds a cancelled job may take to acknowledge before it is
    /// abandoned.
    #[serde(default = "default_cancel_grace")]
    #[validate(range(min = 1, max = 3600, message = "Cancel grace must be between 1 and 3600 seconds"))]
    pub cancel_grace_secs: u64,
    /// Interval between polls of transitional states, in milliseconds.
    #[serde(default = "default_poll_interval")]
    #[validate(range(min = 10, max = 60_000, message = "Poll interval must be between 10 and 60000 ms"))]
    pub poll_interval_ms: u64,
    /// Polls before a transitional state is given up on.
    #[serde(default = "default_max_polls")]
    #[validate(range(min = 1, max = 10_000, message = "Max polls must be between 1 and 10000"))]
    pub max_polls: u32,
}

/// Drift status persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSettings {
    /// Record drift status after every reconciliation.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// State file path; defaults to `.convergent/drift.json`.
    #[serde(default)]
    pub path: Option<String>,
}

/// A named script as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptDefinition {
    /// Script text.
    pub body: String,
    /// Environment bindings.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Name of the credential handed to the script.
    #[serde(default)]
    pub credential: Option<String>,
    /// Forward `DEBUG:` lines.
    #[serde(default)]
    pub include_debug: bool,
    /// Forward `VERBOSE:` lines.
    #[serde(default)]
    pub include_verbose: bool,
    /// Return `OUTPUT:` values as the result.
    #[serde(default)]
    pub collect_output: bool,
    /// Run the script even in simulation mode.
    #[serde(default)]
    pub run_in_simulation: bool,
}

fn default_address() -> String {
    String::from(DEFAULT_AGENT_ADDRESS)
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_cancel_grace() -> u64 {
    30
}

const fn default_poll_interval() -> u64 {
    500
}

const fn default_max_polls() -> u32 {
    120
}

const fn default_true() -> bool {
    true
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_secs: default_connect_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
        }
    }
}

impl AgentSettings {
    /// Connect timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Cancellation grace period as a duration.
    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Polling policy for transitional states.
    #[must_use]
    pub const fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.poll_interval_ms), self.max_polls)
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl ScriptDefinition {
    /// Builds the job for this script. The credential is attached by the
    /// reconciler.
    #[must_use]
    pub fn to_job(&self, simulation: bool) -> ScriptJob {
        let mut job = ScriptJob::new(self.body.clone());
        job.include_debug = self.include_debug;
        job.include_verbose = self.include_verbose;
        job.collect_output = self.collect_output;
        job.run_in_simulation = self.run_in_simulation;
        job.simulation = simulation;
        for (name, value) in &self.variables {
            job = job.with_variable(name.clone(), value.clone());
        }
        job
    }
}

impl RunConfig {
    /// Looks up a script by name.
    #[must_use]
    pub fn script(&self, name: &str) -> Option<&ScriptDefinition> {
        self.scripts.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: RunConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config.agent.address, DEFAULT_AGENT_ADDRESS);
        assert_eq!(config.agent.cancel_grace(), Duration::from_secs(30));
        assert!(config.state.enabled);
        assert!(config.resources.is_empty());
        assert!(config.agent.validate().is_ok());
    }

    #[test]
    fn test_agent_settings_ranges() {
        let settings = AgentSettings {
            connect_timeout_secs: 0,
            ..AgentSettings::default()
        };
        let errors = settings.validate().expect_err("out of range");
        assert!(errors.field_errors().contains_key("connect_timeout_secs"));
    }

    #[test]
    fn test_script_definition_to_job() {
        let yaml = r"
body: echo hi
variables:
  B: two
  A: one
credential: deploy
collect_output: true
";
        let definition: ScriptDefinition = serde_yaml::from_str(yaml).expect("parse");
        let job = definition.to_job(true);

        assert!(job.simulation);
        assert!(job.collect_output);
        assert!(!job.run_in_simulation);
        assert!(job.credential.is_none());
        let names: Vec<&str> = job.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
