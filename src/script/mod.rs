//! Script execution on the agent.
//!
//! A [`ScriptJob`] carries the script body, its variables and an optional
//! credential. The agent's [`ScriptHost`] runs it and forwards classified
//! output lines as log and progress events.

mod host;
mod job;
mod output;

pub use host::{ProcessScriptHost, ScriptHost, CREDENTIAL_USERNAME_VAR};
pub use job::{ScriptJob, ScriptResult, ScriptVariable};
pub use output::{classify, OutputCollector, ScriptMessage, ScriptStream};
