//! Web server sites, applications and virtual directories.

use serde::{Deserialize, Serialize};

use crate::compare::{Case, FieldComparer};
use crate::credential::Credential;
use crate::error::{ConvergentError, Result, WireError};
use crate::job::wire::{wire_enum, wire_record, Wire, WireReader, WireWriter};

use super::any::AnyTemplate;
use super::kind::ResourceKind;
use super::service::default_exists;
use super::template::{key_part, pick, require, Prerequisite, Resource};

/// Whether a site is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteState {
    /// Serving requests.
    Started,
    /// Not serving.
    Stopped,
}

wire_enum!(SiteState {
    Started = 0,
    Stopped = 1,
});

impl std::fmt::Display for SiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Started => "Started",
            Self::Stopped => "Stopped",
        })
    }
}

/// Normalizes a virtual path to `/a/b` form. The root is `/`.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .trim()
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

fn site_prerequisite(site: &str) -> Prerequisite {
    Prerequisite {
        kind: ResourceKind::WebSite,
        key: key_part(site),
    }
}

/// A site, identified by its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSite {
    /// Site name.
    pub name: String,
    /// Whether the site exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Serving state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SiteState>,
    /// Content root on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_path: Option<String>,
    /// Application pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_pool: Option<String>,
    /// Bindings such as `http/*:80:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Vec<String>>,
}

wire_record!(WebSite {
    exists,
    state,
    name,
    physical_path,
    application_pool,
    bindings,
});

impl WebSite {
    /// Creates a template requiring the site to exist.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: true,
            state: None,
            physical_path: None,
            application_pool: None,
            bindings: None,
        }
    }
}

impl Resource for WebSite {
    const KIND: ResourceKind = ResourceKind::WebSite;

    fn configuration_key(&self) -> String {
        key_part(&self.name)
    }

    fn validate(&self) -> Result<()> {
        require(Self::KIND, "name", &self.name)?;
        if let Some(bindings) = &self.bindings {
            for binding in bindings {
                if binding.split_once('/').is_none_or(|(protocol, _)| protocol.is_empty()) {
                    return Err(ConvergentError::invalid_template(
                        Self::KIND.type_name(),
                        "bindings",
                        format!("'{binding}' is not protocol/address:port:host"),
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
            "PhysicalPath",
            self.physical_path.as_deref(),
            actual.physical_path.as_deref(),
            Case::Insensitive,
        );
        comparer.text(
            "ApplicationPool",
            self.application_pool.as_deref(),
            actual.application_pool.as_deref(),
            Case::Insensitive,
        );
        comparer.set(
            "Bindings",
            self.bindings.as_deref(),
            actual.bindings.as_deref(),
            Case::Insensitive,
        );
        comparer.value("State", self.state.as_ref(), actual.state.as_ref());
    }

    fn overlay(&self, current: Option<&Self>) -> Self {
        if !self.exists {
            return self.absent();
        }
        let base = current.cloned().unwrap_or_else(|| self.absent());
        Self {
            name: self.name.clone(),
            exists: true,
            state: pick(self.state.as_ref(), base.state.as_ref()),
            physical_path: pick(self.physical_path.as_ref(), base.physical_path.as_ref()),
            application_pool: pick(self.application_pool.as_ref(), base.application_pool.as_ref()),
            bindings: pick(self.bindings.as_ref(), base.bindings.as_ref()),
        }
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::WebSite(self)
    }
}

/// An application under a site, identified by site and virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebApplication {
    /// Owning site.
    pub site: String,
    /// Virtual path, e.g. `/api`.
    pub path: String,
    /// Whether the application exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Content root on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_path: Option<String>,
    /// Application pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_pool: Option<String>,
}

wire_record!(WebApplication {
    exists,
    site,
    path,
    physical_path,
    application_pool,
});

impl Resource for WebApplication {
    const KIND: ResourceKind = ResourceKind::WebApplication;

    fn configuration_key(&self) -> String {
        format!("{}{}", key_part(&self.site), key_part(&normalize_path(&self.path)))
    }

    fn validate(&self) -> Result<()> {
        require(Self::KIND, "site", &self.site)?;
        require(Self::KIND, "path", &self.path)?;
        if normalize_path(&self.path) == "/" {
            return Err(ConvergentError::invalid_template(
                Self::KIND.type_name(),
                "path",
                "the root path belongs to the site",
            ));
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn absent(&self) -> Self {
        Self {
            site: self.site.clone(),
            path: self.path.clone(),
            exists: false,
            physical_path: None,
            application_pool: None,
        }
    }

    fn compare_fields(&self, actual: &Self, comparer: &mut FieldComparer) {
        comparer.text(
            "PhysicalPath",
            self.physical_path.as_deref(),
            actual.physical_path.as_deref(),
            Case::Insensitive,
        );
        comparer.text(
            "ApplicationPool",
            self.application_pool.as_deref(),
            actual.application_pool.as_deref(),
            Case::Insensitive,
        );
    }

    fn overlay(&self, current: Option<&Self>) -> Self {
        if !self.exists {
            return self.absent();
        }
        let base = current.cloned().unwrap_or_else(|| self.absent());
        Self {
            site: self.site.clone(),
            path: self.path.clone(),
            exists: true,
            physical_path: pick(self.physical_path.as_ref(), base.physical_path.as_ref()),
            application_pool: pick(self.application_pool.as_ref(), base.application_pool.as_ref()),
        }
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        vec![site_prerequisite(&self.site)]
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::WebApplication(self)
    }
}

/// A virtual directory under a site or application.
///
/// `credential_name` is resolved by the controller into `credential` just
/// before the job is built; only the resolved credential travels to the
/// agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDirectory {
    /// Owning site.
    pub site: String,
    /// Owning application path; `/` for the site root.
    #[serde(default = "root_path")]
    pub application: String,
    /// Virtual path relative to the application.
    pub path: String,
    /// Whether the directory exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Content root on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_path: Option<String>,
    /// Name of the credential used to reach `physical_path`.
    #[serde(default, rename = "credential", skip_serializing_if = "Option::is_none")]
    pub credential_name: Option<String>,
    /// Resolved credential. Never written to configuration files.
    #[serde(skip)]
    pub credential: Option<Credential>,
}

fn root_path() -> String {
    String::from("/")
}

impl Wire for VirtualDirectory {
    fn encode(&self, writer: &mut WireWriter) {
        self.exists.encode(writer);
        self.site.encode(writer);
        self.application.encode(writer);
        self.path.encode(writer);
        self.physical_path.encode(writer);
        self.credential.encode(writer);
    }

    fn decode(reader: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        Ok(Self {
            exists: bool::decode(reader)?,
            site: String::decode(reader)?,
            application: String::decode(reader)?,
            path: String::decode(reader)?,
            physical_path: Option::decode(reader)?,
            credential_name: None,
            credential: Option::decode(reader)?,
        })
    }
}

impl Resource for VirtualDirectory {
    const KIND: ResourceKind = ResourceKind::VirtualDirectory;

    fn configuration_key(&self) -> String {
        let application = normalize_path(&self.application);
        let path = normalize_path(&self.path);
        let full = if application == "/" {
            path
        } else {
            format!("{application}{path}")
        };
        format!("{}{}", key_part(&self.site), key_part(&full))
    }

    fn validate(&self) -> Result<()> {
        require(Self::KIND, "site", &self.site)?;
        require(Self::KIND, "path", &self.path)?;
        if normalize_path(&self.path) == "/" {
            return Err(ConvergentError::invalid_template(
                Self::KIND.type_name(),
                "path",
                "the root directory belongs to the application",
            ));
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn absent(&self) -> Self {
        Self {
            site: self.site.clone(),
            application: self.application.clone(),
            path: self.path.clone(),
            exists: false,
            physical_path: None,
            credential_name: None,
            credential: None,
        }
    }

    fn compare_fields(&self, actual: &Self, comparer: &mut FieldComparer) {
        comparer.text(
            "PhysicalPath",
            self.physical_path.as_deref(),
            actual.physical_path.as_deref(),
            Case::Insensitive,
        );
        comparer.text(
            "Username",
            self.credential.as_ref().map(|c| c.username.as_str()),
            actual.credential.as_ref().map(|c| c.username.as_str()),
            Case::Insensitive,
        );
    }

    fn overlay(&self, current: Option<&Self>) -> Self {
        if !self.exists {
            return self.absent();
        }
        let base = current.cloned().unwrap_or_else(|| self.absent());
        Self {
            site: self.site.clone(),
            application: self.application.clone(),
            path: self.path.clone(),
            exists: true,
            physical_path: pick(self.physical_path.as_ref(), base.physical_path.as_ref()),
            credential_name: None,
            credential: pick(self.credential.as_ref(), base.credential.as_ref()),
        }
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        let mut prerequisites = vec![site_prerequisite(&self.site)];
        let application = normalize_path(&self.application);
        if application != "/" {
            prerequisites.push(Prerequisite {
                kind: ResourceKind::WebApplication,
                key: format!("{}{}", key_part(&self.site), key_part(&application)),
            });
        }
        prerequisites
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::VirtualDirectory(self)
    }

    fn credential_name(&self) -> Option<&str> {
        self.credential_name.as_deref()
    }

    fn attach_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }
}
