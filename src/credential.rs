//! Credentials and secret handling.
//!
//! Secrets live in a [`SecretBuffer`] whose backing storage is zeroed when
//! released. The wire layout of a [`Credential`] is a `u32` length-prefixed
//! username followed by a `u32` length-prefixed secret; every temporary
//! buffer used to encode or decode it is zeroed on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{CredentialError, ConvergentError, Result, WireError};
use crate::job::wire::{self, Wire, WireReader, WireWriter};

/// Default prefix of the environment variables read by
/// [`EnvCredentialResolver`].
pub const DEFAULT_ENV_PREFIX: &str = "CONVERGENT_CREDENTIAL";

/// Secret bytes that are zeroed when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBuffer(Zeroizing<Vec<u8>>);

impl SecretBuffer {
    /// Takes ownership of the bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Runs `f` with scoped access to the secret.
    pub fn expose<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.0)
    }

    /// Length of the secret in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SecretBuffer {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuffer(<{} bytes redacted>)", self.0.len())
    }
}

/// A username and secret pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Account name.
    pub username: String,
    secret: SecretBuffer,
}

impl Credential {
    /// Creates a credential.
    #[must_use]
    pub fn new(username: impl Into<String>, secret: SecretBuffer) -> Self {
        Self {
            username: username.into(),
            secret,
        }
    }

    /// Returns the secret.
    #[must_use]
    pub const fn secret(&self) -> &SecretBuffer {
        &self.secret
    }

    /// Encodes the credential into a buffer zeroed on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if a field exceeds the `u32` length prefix.
    pub fn to_protected_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut writer = WireWriter::with_capacity(8 + self.username.len() + self.secret.len());
        self.encode(&mut writer);
        // `finish` hands back the writer's own buffer, so the wrapping below
        // covers the only copy of the secret.
        match writer.finish() {
            Ok(bytes) => Ok(Zeroizing::new(bytes)),
            Err(e) => Err(e.into()),
        }
    }

    /// Decodes a credential from its fixed layout.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the bytes do not hold exactly one credential.
    pub fn from_protected_bytes(bytes: &[u8]) -> Result<Self> {
        wire::from_bytes(bytes).map_err(|e| {
            ConvergentError::Credential(CredentialError::Malformed {
                message: e.to_string(),
            })
        })
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &self.secret)
            .finish()
    }
}

impl Wire for Credential {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_str(&self.username);
        self.secret.expose(|secret| writer.put_bytes(secret));
    }

    fn decode(reader: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        let username = reader.get_string()?;
        let secret = SecretBuffer::new(reader.get_bytes()?.to_vec());
        Ok(Self { username, secret })
    }
}

/// Resolves a credential name to a username and secret.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Looks up a credential by name.
    ///
    /// # Errors
    ///
    /// Returns `CredentialNotFound` if the name is unknown.
    async fn resolve(&self, name: &str) -> Result<Credential>;
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `<PREFIX>_<NAME>_USERNAME` and `<PREFIX>_<NAME>_SECRET`.
///
/// The name is upper-cased and every character that is not alphanumeric
/// becomes `_`, so `web-deploy` reads `CONVERGENT_CREDENTIAL_WEB_DEPLOY_*`.
#[derive(Clone)]
pub struct EnvCredentialResolver {
    prefix: String,
    lookup: Lookup,
}

impl EnvCredentialResolver {
    /// Creates a resolver reading the process environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lookup(DEFAULT_ENV_PREFIX, |key| std::env::var(key).ok())
    }

    /// Creates a resolver over a custom variable source.
    #[must_use]
    pub fn with_lookup(
        prefix: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            lookup: Arc::new(lookup),
        }
    }

    fn variable(&self, name: &str, suffix: &str) -> String {
        let name: String = name
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_{}_{}", self.prefix, name, suffix)
    }
}

impl Default for EnvCredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvCredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentialResolver")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, name: &str) -> Result<Credential> {
        let not_found = || {
            ConvergentError::Credential(CredentialError::NotFound {
                name: name.to_string(),
            })
        };

        let username = (self.lookup)(&self.variable(name, "USERNAME")).ok_or_else(not_found)?;
        let secret = Zeroizing::new((self.lookup)(&self.variable(name, "SECRET")).ok_or_else(not_found)?);
        debug!("Resolved credential '{}' from the environment", name);

        Ok(Credential::new(username, SecretBuffer::from(secret.as_str())))
    }
}

/// Serves credentials from memory.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialResolver {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentialResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential under `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, credential: Credential) -> Self {
        self.credentials.insert(name.into(), credential);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, name: &str) -> Result<Credential> {
        self.credentials.get(name).cloned().ok_or_else(|| {
            ConvergentError::Credential(CredentialError::NotFound {
                name: name.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn deploy() -> Credential {
        Credential::new("deploy", SecretBuffer::from("p@ss"))
    }

    #[test]
    fn test_fixed_layout() {
        let bytes = deploy().to_protected_bytes().expect("encode");
        assert_eq!(
            bytes.as_slice(),
            &[6, 0, 0, 0, b'd', b'e', b'p', b'l', b'o', b'y', 4, 0, 0, 0, b'p', b'@', b's', b's']
        );

        let decoded = Credential::from_protected_bytes(&bytes).expect("decode");
        assert_eq!(decoded, deploy());
    }

    #[test]
    fn test_truncated_credential_is_malformed() {
        let bytes = deploy().to_protected_bytes().expect("encode");
        let err = Credential::from_protected_bytes(&bytes[..bytes.len() - 2]).expect_err("truncated");
        assert!(matches!(
            err,
            ConvergentError::Credential(CredentialError::Malformed { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", deploy());
        assert!(rendered.contains("deploy"));
        assert!(!rendered.contains("p@ss"));
    }

    #[test]
    fn test_secret_is_exposed_in_scope() {
        let credential = deploy();
        let length = credential.secret().expose(<[u8]>::len);
        assert_eq!(length, 4);
    }

    #[tokio::test]
    async fn test_env_resolver_normalizes_names() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CONVERGENT_CREDENTIAL_WEB_DEPLOY_USERNAME", "svc-web"),
            ("CONVERGENT_CREDENTIAL_WEB_DEPLOY_SECRET", "hunter2"),
        ]);
        let resolver = EnvCredentialResolver::with_lookup(DEFAULT_ENV_PREFIX, move |key| {
            vars.get(key).map(|v| (*v).to_string())
        });

        let credential = resolver.resolve("web-deploy").await.expect("resolve");
        assert_eq!(credential.username, "svc-web");
        assert!(credential.secret().expose(|s| s == b"hunter2"));

        let err = resolver.resolve("other").await.expect_err("missing");
        assert_eq!(err.code(), ErrorCode::CredentialNotFound);
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticCredentialResolver::new().with("deploy", deploy());
        assert_eq!(resolver.resolve("deploy").await.expect("resolve"), deploy());
        assert!(resolver.resolve("missing").await.is_err());
    }
}
