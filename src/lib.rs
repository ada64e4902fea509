// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Convergent
//!
//! Declarative, idempotent configuration of hosts through remote agents.
//!
//! ## Overview
//!
//! A controller describes the desired state of host resources (services,
//! registry keys and values, firewall rules, web sites, applications and
//! virtual directories) as templates. For each template it:
//!
//! - Validates the template locally
//! - Collects the actual state through an agent
//! - Compares the two field by field
//! - Configures the resource only when they differ, then re-collects to
//!   confirm
//!
//! ## Architecture
//!
//! Every interaction with a host is a typed **job** executed by an agent:
//!
//! 1. **Controller**: builds jobs and submits them through a [`job::JobClient`]
//! 2. **Channel**: carries the job in-process or over a framed stream
//! 3. **Agent**: dispatches the job by kind to a resource adapter or script host
//!
//! Logs and progress stream back while the job runs; cancellation flows the
//! other way.
//!
//! ## Modules
//!
//! - [`error`]: Error hierarchy and its wire taxonomy
//! - [`job`]: Wire schema, job protocol, agent and channels
//! - [`resource`]: Resource templates, adapters and the in-memory host
//! - [`compare`]: Field-level comparison
//! - [`reconciler`]: Controller-side reconciliation
//! - [`script`]: Script jobs and the process script host
//! - [`credential`]: Secrets and credential resolution
//! - [`config`]: Run configuration parsing and validation
//! - [`state`]: Persisted drift status
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! agent:
//!   address: 10.0.0.5:7390
//!
//! resources:
//!   - kind: service
//!     name: Spooler
//!     start_mode: Automatic
//!     state: Running
//!   - kind: firewall_rule
//!     name: Web
//!     protocol: Tcp
//!     local_ports: 80-81,443
//!
//! scripts:
//!   warmup:
//!     body: curl -s http://localhost/
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod compare;
pub mod config;
pub mod credential;
pub mod error;
pub mod job;
pub mod reconciler;
pub mod resource;
pub mod script;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use compare::{compare, ComparisonResult, Difference};
pub use config::{ConfigParser, ConfigValidator, RunConfig, TemplateHasher};
pub use credential::{Credential, CredentialResolver, SecretBuffer};
pub use error::{ConvergentError, Result};
pub use job::{Agent, AgentChannel, CancellationSignal, JobClient, LocalChannel, StreamChannel};
pub use reconciler::{ReconcileMode, ReconciliationResult, Reconciler};
pub use resource::{AnyTemplate, MemoryHost, Resource, ResourceKind};
pub use script::{ProcessScriptHost, ScriptHost, ScriptJob};
pub use state::{DriftState, DriftStatus, LocalStateStore, StateStore};
