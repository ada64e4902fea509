//! Run configuration.
//!
//! - Parsing `convergent.yaml` and agent inventories
//! - Validation before anything reaches an agent
//! - Template fingerprints for the drift store

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::TemplateHasher;
pub use parser::{
    find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_AGENT_ADDRESS, ENV_STATE_PATH,
};
pub use spec::{
    AgentSettings, RunConfig, ScriptDefinition, StateSettings, DEFAULT_AGENT_ADDRESS,
};
pub use self::validator::{ConfigValidator, ValidationReport};
