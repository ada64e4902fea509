//! The contract every resource template implements.

use std::fmt::Debug;

use crate::compare::FieldComparer;
use crate::credential::Credential;
use crate::error::{ConvergentError, Result};
use crate::job::wire::Wire;

use super::any::AnyTemplate;
use super::kind::ResourceKind;

/// Another resource that must exist before this one can be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    /// Kind of the required resource.
    pub kind: ResourceKind,
    /// Configuration key of the required resource.
    pub key: String,
}

impl std::fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.kind, self.key)
    }
}

/// A resource template: the desired state of one managed resource, and the
/// shape its collected actual state takes.
///
/// Fields left `None` are unspecified; they are neither compared nor
/// changed.
pub trait Resource: Wire + Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Kind of this resource.
    const KIND: ResourceKind;

    /// Stable identity derived from the identity fields.
    fn configuration_key(&self) -> String;

    /// Checks identity fields and value formats.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTemplate` naming the offending field.
    fn validate(&self) -> Result<()>;

    /// Whether the resource should exist (or, for collected state, does).
    fn exists(&self) -> bool;

    /// The collected state of a resource that is not present.
    #[must_use]
    fn absent(&self) -> Self;

    /// Compares every specified field, in declaration order.
    fn compare_fields(&self, actual: &Self, comparer: &mut FieldComparer);

    /// The state that results from applying this template on top of
    /// `current`: specified fields win, unspecified ones are kept.
    #[must_use]
    fn overlay(&self, current: Option<&Self>) -> Self;

    /// Resources that must exist before this one can be created.
    fn prerequisites(&self) -> Vec<Prerequisite> {
        Vec::new()
    }

    /// Wraps the template in the kind-tagged enumeration.
    fn into_any(self) -> AnyTemplate;

    /// Name of the credential the controller must resolve for this
    /// template, if any.
    fn credential_name(&self) -> Option<&str> {
        None
    }

    /// Attaches the resolved credential named by [`Self::credential_name`].
    fn attach_credential(&mut self, _credential: Credential) {}

    /// `kind 'key'`, for log messages.
    fn describe(&self) -> String {
        format!("{} '{}'", Self::KIND, self.configuration_key())
    }
}

/// Rejects an empty identity field.
pub(crate) fn require(kind: ResourceKind, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConvergentError::invalid_template(
            kind.type_name(),
            field,
            "must not be empty",
        ));
    }
    Ok(())
}

/// Lower-cases and trims a key component; identities are case-insensitive.
pub(crate) fn key_part(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Keeps `desired` when specified, otherwise the current value.
pub(crate) fn pick<T: Clone>(desired: Option<&T>, current: Option<&T>) -> Option<T> {
    desired.or(current).cloned()
}
