use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::error::Result;

use super::firewall::FirewallRule;
use super::kind::ResourceKind;
use super::registry::{RegistryKey, RegistryValue};
use super::service::Service;
use super::template::Resource;
use super::web::{VirtualDirectory, WebApplication, WebSite};

/// A template of any kind, tagged by `kind` in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnyTemplate {
    /// A service.
    Service(Service),
    /// A registry key.
    RegistryKey(RegistryKey),
    /// A registry value.
    RegistryValue(RegistryValue),
    /// A firewall rule.
    FirewallRule(FirewallRule),
    /// A site.
    WebSite(WebSite),
    /// An application.
    WebApplication(WebApplication),
    /// A virtual directory.
    VirtualDirectory(VirtualDirectory),
}

/// Runs `$body` with `$template` bound to the concrete template inside an
/// [`AnyTemplate`].
macro_rules! with_template {
    ($any:expr, $template:ident => $body:expr) => {
        match $any {
            $crate::resource::AnyTemplate::Service($template) => $body,
            $crate::resource::AnyTemplate::RegistryKey($template) => $body,
            $crate::resource::AnyTemplate::RegistryValue($template) => $body,
            $crate::resource::AnyTemplate::FirewallRule($template) => $body,
            $crate::resource::AnyTemplate::WebSite($template) => $body,
            $crate::resource::AnyTemplate::WebApplication($template) => $body,
            $crate::resource::AnyTemplate::VirtualDirectory($template) => $body,
        }
    };
}

pub(crate) use with_template;

impl AnyTemplate {
    /// Kind of the wrapped template.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Service(_) => ResourceKind::Service,
            Self::RegistryKey(_) => ResourceKind::RegistryKey,
            Self::RegistryValue(_) => ResourceKind::RegistryValue,
            Self::FirewallRule(_) => ResourceKind::FirewallRule,
            Self::WebSite(_) => ResourceKind::WebSite,
            Self::WebApplication(_) => ResourceKind::WebApplication,
            Self::VirtualDirectory(_) => ResourceKind::VirtualDirectory,
        }
    }

    /// Configuration key of the wrapped template.
    #[must_use]
    pub fn configuration_key(&self) -> String {
        with_template!(self, t => t.configuration_key())
    }

    /// Validates the wrapped template.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTemplate` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        with_template!(self, t => t.validate())
    }

    /// Whether the wrapped template requires the resource to exist.
    #[must_use]
    pub fn exists(&self) -> bool {
        with_template!(self, t => t.exists())
    }

    /// `kind 'key'`, for log messages.
    #[must_use]
    pub fn describe(&self) -> String {
        with_template!(self, t => t.describe())
    }

    /// Name of the credential this template needs, if any.
    #[must_use]
    pub fn credential_name(&self) -> Option<&str> {
        with_template!(self, t => t.credential_name())
    }

    /// Attaches a resolved credential.
    pub fn attach_credential(&mut self, credential: Credential) {
        with_template!(self, t => t.attach_credential(credential));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_tagged_by_kind() {
        let yaml = r"
- kind: service
  name: Spooler
  start_mode: Automatic
- kind: firewall_rule
  name: Web
  local_ports: 80-81,443
  profiles: Domain,Private
- kind: registry_value
  path: HKLM\Software\Acme
  name: Version
  value_kind: DWord
  data: ['3']
- kind: virtual_directory
  site: Default Web Site
  path: images
  credential: content-share
";
        let templates: Vec<AnyTemplate> = serde_yaml::from_str(yaml).expect("parse");

        assert_eq!(templates.len(), 4);
        assert_eq!(templates[0].kind(), ResourceKind::Service);
        assert_eq!(templates[1].configuration_key(), "web");
        assert!(templates.iter().all(AnyTemplate::exists));
        assert_eq!(templates[3].credential_name(), Some("content-share"));
        assert!(templates.iter().all(|t| t.validate().is_ok()));
    }
}
