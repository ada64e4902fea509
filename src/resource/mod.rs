//! Resource kinds, their templates and the adapters that manage them.
//!
//! Every kind implements [`Resource`]; the generic [`CollectJob`],
//! [`ConfigureJob`] and [`EnsureJob`] run against the [`ResourceAdapter`]
//! registered for that kind on the agent.

mod adapter;
mod any;
mod firewall;
mod jobs;
mod kind;
mod lock;
mod memory;
pub mod ports;
mod registry;
mod service;
mod template;
mod web;

pub use adapter::{AdapterRegistry, ResourceAdapter};
pub use any::AnyTemplate;
pub(crate) use any::with_template;
pub use firewall::{Direction, FirewallRule, Protocol, RuleAction};
pub use jobs::{CollectJob, ConfigureJob, ConfigureReceipt, EnsureJob, EnsureReport};
pub use kind::ResourceKind;
pub use lock::{KindGuard, KindLocks};
pub use memory::{MemoryAdapter, MemoryHost, MemoryServiceAdapter};
pub use ports::{expand_port_ranges, PortSet};
pub use registry::{RegistryKey, RegistryValue, RegistryValueKind};
pub use service::{Service, ServiceState, StartMode};
pub use template::{Prerequisite, Resource};
pub use web::{SiteState, VirtualDirectory, WebApplication, WebSite};
