//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Convergent - Declarative configuration of hosts through remote agents.
#[derive(Parser, Debug)]
#[command(name = "convergent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log line format on stderr (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an agent backed by an in-memory host.
    Agent {
        /// Address to listen on (defaults to `agent.address`).
        #[arg(short, long)]
        listen: Option<String>,

        /// YAML list of templates describing the host's initial state.
        #[arg(short, long)]
        inventory: Option<PathBuf>,

        /// Polls a starting service stays in `StartPending`.
        #[arg(long, default_value = "2")]
        start_delay_polls: u32,
    },

    /// Validate the run configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Read the actual state of every configured resource.
    Collect {
        /// Only resources of this kind (e.g. `service`).
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Check every configured resource for drift.
    Test,

    /// Bring every configured resource into its desired state.
    Ensure {
        /// Log what would change without changing anything.
        #[arg(short, long)]
        simulate: bool,

        /// Let the agent collect, compare and configure in one round trip.
        #[arg(long)]
        on_agent: bool,
    },

    /// Run a named script from the configuration on the agent.
    RunScript {
        /// Script name.
        name: String,

        /// Skip the script unless it opts into simulation.
        #[arg(short, long)]
        simulate: bool,
    },

    /// Show the drift status recorded by previous runs.
    Status {
        /// Only show resources that need attention.
        #[arg(short, long)]
        attention: bool,
    },

    /// Manage the drift state file.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show lock information.
    Lock,

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held.
        #[arg(long)]
        force: bool,
    },

    /// Delete every recorded status.
    Clear,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
