use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConvergentError};

/// Every resource kind the agent knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// An operating-system service.
    Service,
    /// A registry key.
    RegistryKey,
    /// A named value under a registry key.
    RegistryValue,
    /// A host firewall rule.
    FirewallRule,
    /// A web server site.
    WebSite,
    /// An application under a site.
    WebApplication,
    /// A virtual directory under a site or application.
    VirtualDirectory,
}

impl ResourceKind {
    /// All kinds, in registration order.
    pub const ALL: [Self; 7] = [
        Self::Service,
        Self::RegistryKey,
        Self::RegistryValue,
        Self::FirewallRule,
        Self::WebSite,
        Self::WebApplication,
        Self::VirtualDirectory,
    ];

    /// Dotted type name, also the prefix of the kind's job names.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::RegistryKey => "registry.key",
            Self::RegistryValue => "registry.value",
            Self::FirewallRule => "firewall.rule",
            Self::WebSite => "web.site",
            Self::WebApplication => "web.application",
            Self::VirtualDirectory => "web.virtual_directory",
        }
    }

    /// Namespace grouping related kinds.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::RegistryKey | Self::RegistryValue => "registry",
            Self::FirewallRule => "firewall",
            Self::WebSite | Self::WebApplication | Self::VirtualDirectory => "web",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = ConvergentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                ConfigError::validation(format!("Unknown resource kind '{s}'"), "kind").into()
            })
    }
}
