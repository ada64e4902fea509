//! Template fingerprints for change detection.
//!
//! A fingerprint is the SHA-256 of a template's kind and wire encoding, so
//! it changes exactly when something that would travel to the agent changes.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::job::wire::to_bytes;
use crate::resource::{with_template, AnyTemplate, Resource};

use super::spec::RunConfig;

/// Computes template and configuration fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateHasher;

impl TemplateHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fingerprint of one template.
    ///
    /// Call this before a credential is attached; resolved secrets must not
    /// feed a persisted hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be encoded.
    pub fn fingerprint<R: Resource>(&self, template: &R) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(R::KIND.type_name().as_bytes());
        hasher.update([0u8]);
        hasher.update(to_bytes(template)?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of a template of any kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be encoded.
    pub fn fingerprint_any(&self, template: &AnyTemplate) -> Result<String> {
        with_template!(template, t => self.fingerprint(t))
    }

    /// Fingerprint of a whole run configuration: every template, sorted so
    /// the order of the file does not matter, then every script.
    ///
    /// # Errors
    ///
    /// Returns an error if a template cannot be encoded.
    pub fn hash_config(&self, config: &RunConfig) -> Result<String> {
        let mut fingerprints = config
            .resources
            .iter()
            .map(|t| self.fingerprint_any(t))
            .collect::<Result<Vec<_>>>()?;
        fingerprints.sort_unstable();

        let mut hasher = Sha256::new();
        for fingerprint in &fingerprints {
            hasher.update(fingerprint.as_bytes());
        }
        for (name, script) in &config.scripts {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(script.body.as_bytes());
            hasher.update([0u8]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// First 8 characters, for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}
