//! Operating-system services.

use serde::{Deserialize, Serialize};

use crate::compare::{Case, FieldComparer};
use crate::error::Result;
use crate::job::wire::{wire_enum, wire_record};

use super::any::AnyTemplate;
use super::kind::ResourceKind;
use super::template::{key_part, pick, require, Resource};

/// How a service starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartMode {
    /// Started at boot.
    Automatic,
    /// Started on demand.
    Manual,
    /// Cannot be started.
    Disabled,
}

wire_enum!(StartMode {
    Automatic = 0,
    Manual = 1,
    Disabled = 2,
});

/// Runtime state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// Transitioning to `Running`.
    StartPending,
    /// Transitioning to `Stopped`.
    StopPending,
}

wire_enum!(ServiceState {
    Running = 0,
    Stopped = 1,
    StartPending = 2,
    StopPending = 3,
});

impl std::fmt::Display for StartMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Automatic => "Automatic",
            Self::Manual => "Manual",
            Self::Disabled => "Disabled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::StartPending => "StartPending",
            Self::StopPending => "StopPending",
        };
        write!(f, "{s}")
    }
}

/// A service, identified by its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Whether the service is installed.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Start mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_mode: Option<StartMode>,
    /// Runtime state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ServiceState>,
    /// Account the service runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Names of services this one depends on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
}

pub(crate) const fn default_exists() -> bool {
    true
}

wire_record!(Service {
    exists,
    start_mode,
    state,
    name,
    display_name,
    account,
    dependencies,
});

impl Service {
    /// Creates a template that only requires the service to exist.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: true,
            display_name: None,
            start_mode: None,
            state: None,
            account: None,
            dependencies: None,
        }
    }
}

impl Resource for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn configuration_key(&self) -> String {
        key_part(&self.name)
    }

    fn validate(&self) -> Result<()> {
        require(Self::KIND, "name", &self.name)
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn absent(&self) -> Self {
        Self {
            exists: false,
            ..Self::named(self.name.clone())
        }
    }

    fn compare_fields(&self, actual: &Self, comparer: &mut FieldComparer) {
        comparer.text(
            "Name",
            Some(self.name.as_str()),
            Some(actual.name.as_str()),
            Case::Insensitive,
        );
        comparer.text(
            "DisplayName",
            self.display_name.as_deref(),
            actual.display_name.as_deref(),
            Case::Sensitive,
        );
        comparer.value("StartMode", self.start_mode.as_ref(), actual.start_mode.as_ref());
        comparer.value("State", self.state.as_ref(), actual.state.as_ref());
        comparer.text(
            "Account",
            self.account.as_deref(),
            actual.account.as_deref(),
            Case::Insensitive,
        );
        comparer.set(
            "Dependencies",
            self.dependencies.as_deref(),
            actual.dependencies.as_deref(),
            Case::Insensitive,
        );
    }

    fn overlay(&self, current: Option<&Self>) -> Self {
        if !self.exists {
            return self.absent();
        }
        let base = current.cloned().unwrap_or_else(|| self.absent());
        Self {
            name: self.name.clone(),
            exists: true,
            display_name: pick(self.display_name.as_ref(), base.display_name.as_ref()),
            start_mode: pick(self.start_mode.as_ref(), base.start_mode.as_ref()),
            state: pick(self.state.as_ref(), base.state.as_ref()),
            account: pick(self.account.as_ref(), base.account.as_ref()),
            dependencies: pick(self.dependencies.as_ref(), base.dependencies.as_ref()),
        }
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::Service(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::compare;

    fn spooler() -> Service {
        Service {
            start_mode: Some(StartMode::Automatic),
            state: Some(ServiceState::Running),
            ..Service::named("Spooler")
        }
    }

    #[test]
    fn test_start_mode_drift_is_the_only_difference() {
        let actual = Service {
            display_name: Some(String::from("Print Spooler")),
            start_mode: Some(StartMode::Manual),
            state: Some(ServiceState::Running),
            account: Some(String::from("LocalSystem")),
            ..Service::named("spooler")
        };

        let result = compare(&spooler(), &actual);
        assert_eq!(result.len(), 1);
        let difference = result.field("StartMode").expect("StartMode difference");
        assert_eq!(difference.expected, "Automatic");
        assert_eq!(difference.actual, "Manual");
    }

    #[test]
    fn test_missing_service_reports_exists_only() {
        let desired = spooler();
        let result = compare(&desired, &desired.absent());

        assert_eq!(result.len(), 1);
        assert_eq!(result.differences[0].field, "Exists");
        assert_eq!(result.differences[0].expected, "true");
        assert_eq!(result.differences[0].actual, "false");
    }

    #[test]
    fn test_absent_on_both_sides_is_equal() {
        let desired = Service {
            exists: false,
            ..spooler()
        };
        assert!(compare(&desired, &desired.absent()).are_equal());
    }

    #[test]
    fn test_overlay_keeps_unspecified_fields() {
        let current = Service {
            account: Some(String::from("LocalSystem")),
            start_mode: Some(StartMode::Manual),
            ..Service::named("Spooler")
        };

        let next = spooler().overlay(Some(&current));
        assert_eq!(next.start_mode, Some(StartMode::Automatic));
        assert_eq!(next.account.as_deref(), Some("LocalSystem"));
    }

    #[test]
    fn test_key_is_case_insensitive() {
        assert_eq!(
            Service::named("Spooler").configuration_key(),
            Service::named(" spooler ").configuration_key()
        );
        assert!(Service::named("  ").validate().is_err());
    }

    #[test]
    fn test_yaml_defaults() {
        let service: Service =
            serde_yaml::from_str("name: W3SVC\nstart_mode: Automatic\n").expect("parse");
        assert!(service.exists);
        assert_eq!(service.start_mode, Some(StartMode::Automatic));
        assert_eq!(service.state, None);
    }
}
