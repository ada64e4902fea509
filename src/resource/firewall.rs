//! Host firewall rules.

use serde::{Deserialize, Serialize};

use crate::compare::{Case, FieldComparer};
use crate::error::{ConvergentError, Result};
use crate::job::wire::{wire_enum, wire_record};

use super::any::AnyTemplate;
use super::kind::ResourceKind;
use super::ports::PortSet;
use super::service::default_exists;
use super::template::{key_part, pick, require, Resource};

/// Profiles a rule may apply to.
const PROFILES: [&str; 4] = ["Domain", "Private", "Public", "Any"];

/// Traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Incoming traffic.
    Inbound,
    /// Outgoing traffic.
    Outbound,
}

wire_enum!(Direction {
    Inbound = 0,
    Outbound = 1,
});

/// What the rule does with matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// Let it through.
    Allow,
    /// Drop it.
    Block,
}

wire_enum!(RuleAction { Allow = 0, Block = 1 });

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// Any protocol.
    Any,
}

wire_enum!(Protocol {
    Tcp = 0,
    Udp = 1,
    Any = 2,
});

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inbound => "Inbound",
            Self::Outbound => "Outbound",
        })
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Allow => "Allow",
            Self::Block => "Block",
        })
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Any => "Any",
        })
    }
}

/// A firewall rule, identified by its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Rule name.
    pub name: String,
    /// Whether the rule exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Whether the rule is enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Traffic direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Allow or block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
    /// Transport protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Local ports, e.g. `80-81,443` or `Any`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ports: Option<String>,
    /// Remote addresses or subnets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addresses: Option<Vec<String>>,
    /// Comma-delimited profiles, e.g. `Domain,Private`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<String>,
}

wire_record!(FirewallRule {
    exists,
    enabled,
    direction,
    action,
    protocol,
    name,
    display_name,
    description,
    local_ports,
    remote_addresses,
    profiles,
});

impl FirewallRule {
    /// Creates a template requiring the rule to exist.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: true,
            enabled: None,
            direction: None,
            action: None,
            protocol: None,
            display_name: None,
            description: None,
            local_ports: None,
            remote_addresses: None,
            profiles: None,
        }
    }

    fn invalid(field: &str, message: impl Into<String>) -> ConvergentError {
        ConvergentError::invalid_template(ResourceKind::FirewallRule.type_name(), field, message)
    }
}

impl Resource for FirewallRule {
    const KIND: ResourceKind = ResourceKind::FirewallRule;

    fn configuration_key(&self) -> String {
        key_part(&self.name)
    }

    fn validate(&self) -> Result<()> {
        require(Self::KIND, "name", &self.name)?;

        if let Some(ports) = &self.local_ports {
            PortSet::parse(ports).map_err(|e| Self::invalid("local_ports", e.to_string()))?;
            if matches!(self.protocol, Some(Protocol::Any)) && !ports.trim().eq_ignore_ascii_case("any") {
                return Err(Self::invalid(
                    "local_ports",
                    "ports require the TCP or UDP protocol",
                ));
            }
        }

        if let Some(profiles) = &self.profiles {
            for profile in profiles.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                if !PROFILES.iter().any(|known| known.eq_ignore_ascii_case(profile)) {
                    return Err(Self::invalid(
                        "profiles",
                        format!("unknown profile '{profile}'"),
                    ));
                }
            }
        }
        Ok(())
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
        comparer.text(
            "Description",
            self.description.as_deref(),
            actual.description.as_deref(),
            Case::Sensitive,
        );
        comparer.value("Enabled", self.enabled.as_ref(), actual.enabled.as_ref());
        comparer.value("Direction", self.direction.as_ref(), actual.direction.as_ref());
        comparer.value("Action", self.action.as_ref(), actual.action.as_ref());
        comparer.value("Protocol", self.protocol.as_ref(), actual.protocol.as_ref());
        comparer.port_set(
            "LocalPorts",
            self.local_ports.as_deref(),
            actual.local_ports.as_deref(),
        );
        comparer.set(
            "RemoteAddresses",
            self.remote_addresses.as_deref(),
            actual.remote_addresses.as_deref(),
            Case::Insensitive,
        );
        comparer.delimited_set(
            "Profiles",
            self.profiles.as_deref(),
            actual.profiles.as_deref(),
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
            enabled: pick(self.enabled.as_ref(), base.enabled.as_ref()),
            direction: pick(self.direction.as_ref(), base.direction.as_ref()),
            action: pick(self.action.as_ref(), base.action.as_ref()),
            protocol: pick(self.protocol.as_ref(), base.protocol.as_ref()),
            display_name: pick(self.display_name.as_ref(), base.display_name.as_ref()),
            description: pick(self.description.as_ref(), base.description.as_ref()),
            local_ports: pick(self.local_ports.as_ref(), base.local_ports.as_ref()),
            remote_addresses: pick(self.remote_addresses.as_ref(), base.remote_addresses.as_ref()),
            profiles: pick(self.profiles.as_ref(), base.profiles.as_ref()),
        }
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::FirewallRule(self)
    }
}
