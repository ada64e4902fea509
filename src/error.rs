//! Error types for the Convergent reconciliation system.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation: template validation, job transport, wire decoding,
//! resource adapters, credentials, scripts, configuration and drift state.
//!
//! Errors that happen on the agent cross the job boundary as a
//! [`RemoteFailure`] (a taxonomy code plus context) and are rebuilt into the
//! same variants on the controller side.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Convergent system.
#[derive(Debug, Error)]
pub enum ConvergentError {
    /// Template validation errors.
    #[error("Invalid template: {0}")]
    Template(#[from] TemplateError),

    /// Agent channel errors.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Wire format errors.
    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    /// Resource adapter errors.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Credential errors.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Script execution errors.
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Drift state errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Template validation errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// An identity field is missing or malformed.
    #[error("{kind} template field '{field}': {message}")]
    InvalidField {
        /// Resource kind of the template.
        kind: String,
        /// Offending field.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// A port list such as `80-81,443` could not be parsed.
    #[error("Invalid port range '{spec}': {reason}")]
    InvalidPortRange {
        /// The offending port list.
        spec: String,
        /// Description of the problem.
        reason: String,
    },
}

/// Agent channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The agent could not be reached.
    #[error("Agent unavailable: {message}")]
    AdapterUnavailable {
        /// Description of the connection failure.
        message: String,
    },

    /// The transport broke while a job was in flight.
    #[error("Channel failure: {message}")]
    ChannelFailure {
        /// Description of the failure.
        message: String,
    },

    /// The cancellation signal fired before the job completed.
    #[error("Job was cancelled")]
    Cancelled,

    /// The job raised an unexpected error on the agent.
    #[error("Job failed on agent: {message}")]
    JobFailed {
        /// Error message reported by the agent.
        message: String,
    },

    /// The agent has no handler registered for a job kind.
    #[error("Agent does not know job kind '{kind}'")]
    UnknownJob {
        /// The unknown job kind.
        kind: String,
    },

    /// A job state transition was not allowed.
    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidTransition {
        /// State before the transition.
        from: String,
        /// Requested state.
        to: String,
    },
}

/// Wire format errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Input ended before a field was complete.
    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes required by the field.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    /// An enumeration or flag byte had an unknown value.
    #[error("Invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// Type being decoded.
        type_name: &'static str,
        /// The unexpected tag value.
        tag: u8,
    },

    /// Bytes were left over after decoding a value.
    #[error("{count} trailing bytes after decoded value")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },

    /// A length did not fit in the fixed-width length prefix.
    #[error("Length {length} exceeds the wire limit")]
    LengthOverflow {
        /// The oversized length.
        length: usize,
    },

    /// The agent could not decode or encode a job.
    #[error("Agent wire error: {message}")]
    Remote {
        /// Wire error reported by the agent.
        message: String,
    },

    /// The protocol version in a header is not supported.
    #[error("Unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build speaks.
        expected: u16,
        /// Version found in the header.
        found: u16,
    },
}

/// Resource adapter errors.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A resource the operation depends on does not exist.
    #[error("{kind} '{key}' requires missing {prerequisite}")]
    ResourceMissing {
        /// Resource kind.
        kind: String,
        /// Configuration key of the resource.
        key: String,
        /// Description of the missing prerequisite.
        prerequisite: String,
    },

    /// A mutation failed part-way; partial state may exist.
    #[error("Failed to configure {kind} '{key}': {reason}")]
    ConfigureFailed {
        /// Resource kind.
        kind: String,
        /// Configuration key of the resource.
        key: String,
        /// Reason for failure.
        reason: String,
    },

    /// Reading the actual state failed.
    #[error("Failed to collect {kind} '{key}': {reason}")]
    CollectFailed {
        /// Resource kind.
        kind: String,
        /// Configuration key of the resource.
        key: String,
        /// Reason for failure.
        reason: String,
    },

    /// No adapter is registered for a resource kind.
    #[error("No adapter registered for {kind}")]
    NotRegistered {
        /// Resource kind.
        kind: String,
    },
}

/// Credential errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The resolver has no credential with this name.
    #[error("Credential not found: {name}")]
    NotFound {
        /// Credential name.
        name: String,
    },

    /// A credential payload could not be decoded.
    #[error("Malformed credential payload: {message}")]
    Malformed {
        /// Description of the problem.
        message: String,
    },
}

/// Script execution errors.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script finished with a nonzero exit code.
    #[error("Script exited with code {exit_code}")]
    NonZeroExit {
        /// Exit code reported by the interpreter.
        exit_code: i32,
    },

    /// The interpreter could not be started.
    #[error("Failed to launch script interpreter '{program}': {message}")]
    LaunchFailed {
        /// Interpreter program.
        program: String,
        /// Description of the failure.
        message: String,
    },

    /// The credential secret could not be written to the script.
    #[error("Failed to hand the credential to the script: {message}")]
    CredentialHandoff {
        /// Description of the write failure.
        message: String,
    },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two templates of the same kind share a configuration key.
    #[error("Duplicate {kind} configuration key: {key}")]
    DuplicateKey {
        /// Resource kind.
        kind: String,
        /// The duplicated key.
        key: String,
    },

    /// A script referenced by name is not defined.
    #[error("Unknown script: {name}")]
    UnknownScript {
        /// Script name.
        name: String,
    },
}

/// Drift state errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Result type alias for Convergent operations.
pub type Result<T> = std::result::Result<T, ConvergentError>;

/// Taxonomy code carried across the job boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad caller input.
    InvalidTemplate,
    /// Transport could not reach an adapter.
    AdapterUnavailable,
    /// A required resource is absent.
    ResourceMissing,
    /// A mutation failed.
    ConfigureFailed,
    /// Cancellation fired.
    Cancelled,
    /// Credential lookup failed.
    CredentialNotFound,
    /// Script exited nonzero.
    ScriptExit,
    /// A payload or output failed the wire schema.
    Deserialization,
    /// Any other unexpected failure.
    Failed,
}

/// An agent-side error in transportable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Resource kind or field context, empty when not applicable.
    pub kind: String,
    /// Configuration key or field name, empty when not applicable.
    pub key: String,
    /// Human-readable detail.
    pub message: String,
    /// Script exit code, zero when not applicable.
    pub exit_code: i32,
}

impl ConvergentError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates an invalid-template error.
    #[must_use]
    pub fn invalid_template(
        kind: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Template(TemplateError::InvalidField {
            kind: kind.into(),
            field: field.into(),
            message: message.into(),
        })
    }

    /// Returns true if this error reports a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::Cancelled))
    }

    /// Returns true if this error comes from the transport layer.
    ///
    /// Transport errors are surfaced to the caller and never retried here.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Channel(
                ChannelError::AdapterUnavailable { .. } | ChannelError::ChannelFailure { .. }
            )
        )
    }

    /// Returns the taxonomy code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Template(_) => ErrorCode::InvalidTemplate,
            Self::Channel(ChannelError::AdapterUnavailable { .. }) => ErrorCode::AdapterUnavailable,
            Self::Channel(ChannelError::Cancelled) => ErrorCode::Cancelled,
            Self::Adapter(AdapterError::ResourceMissing { .. }) => ErrorCode::ResourceMissing,
            Self::Adapter(AdapterError::ConfigureFailed { .. }) => ErrorCode::ConfigureFailed,
            Self::Adapter(AdapterError::NotRegistered { .. }) => ErrorCode::AdapterUnavailable,
            Self::Credential(CredentialError::NotFound { .. }) => ErrorCode::CredentialNotFound,
            Self::Script(ScriptError::NonZeroExit { .. }) => ErrorCode::ScriptExit,
            Self::Wire(_) => ErrorCode::Deserialization,
            _ => ErrorCode::Failed,
        }
    }

    /// Converts this error into its transportable form.
    #[must_use]
    pub fn to_remote(&self) -> RemoteFailure {
        let mut failure = RemoteFailure {
            code: self.code(),
            kind: String::new(),
            key: String::new(),
            message: self.to_string(),
            exit_code: 0,
        };

        match self {
            Self::Template(TemplateError::InvalidField { kind, field, message }) => {
                failure.kind.clone_from(kind);
                failure.key.clone_from(field);
                failure.message.clone_from(message);
            }
            Self::Adapter(AdapterError::ResourceMissing { kind, key, prerequisite }) => {
                failure.kind.clone_from(kind);
                failure.key.clone_from(key);
                failure.message.clone_from(prerequisite);
            }
            Self::Adapter(AdapterError::ConfigureFailed { kind, key, reason }) => {
                failure.kind.clone_from(kind);
                failure.key.clone_from(key);
                failure.message.clone_from(reason);
            }
            Self::Adapter(AdapterError::NotRegistered { kind }) => {
                failure.kind.clone_from(kind);
            }
            Self::Credential(CredentialError::NotFound { name }) => {
                failure.key.clone_from(name);
            }
            Self::Script(ScriptError::NonZeroExit { exit_code }) => {
                failure.exit_code = *exit_code;
            }
            Self::Wire(WireError::Remote { message }) => {
                failure.message.clone_from(message);
            }
            Self::Wire(e) => failure.message = e.to_string(),
            _ => {}
        }

        failure
    }
}

impl RemoteFailure {
    /// Rebuilds the controller-side error from a transported failure.
    #[must_use]
    pub fn into_error(self) -> ConvergentError {
        match self.code {
            ErrorCode::InvalidTemplate => ConvergentError::Template(TemplateError::InvalidField {
                kind: self.kind,
                field: self.key,
                message: self.message,
            }),
            ErrorCode::AdapterUnavailable => {
                ConvergentError::Channel(ChannelError::AdapterUnavailable {
                    message: self.message,
                })
            }
            ErrorCode::ResourceMissing => ConvergentError::Adapter(AdapterError::ResourceMissing {
                kind: self.kind,
                key: self.key,
                prerequisite: self.message,
            }),
            ErrorCode::ConfigureFailed => ConvergentError::Adapter(AdapterError::ConfigureFailed {
                kind: self.kind,
                key: self.key,
                reason: self.message,
            }),
            ErrorCode::Cancelled => ConvergentError::Channel(ChannelError::Cancelled),
            ErrorCode::CredentialNotFound => {
                ConvergentError::Credential(CredentialError::NotFound { name: self.key })
            }
            ErrorCode::ScriptExit => ConvergentError::Script(ScriptError::NonZeroExit {
                exit_code: self.exit_code,
            }),
            ErrorCode::Deserialization => ConvergentError::Wire(WireError::Remote {
                message: self.message,
            }),
            ErrorCode::Failed => ConvergentError::Channel(ChannelError::JobFailed {
                message: self.message,
            }),
        }
    }
}

impl ChannelError {
    /// Creates an adapter-unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::AdapterUnavailable {
            message: message.into(),
        }
    }

    /// Creates a channel failure error.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::ChannelFailure {
            message: message.into(),
        }
    }
}

impl AdapterError {
    /// Creates a resource-missing error.
    #[must_use]
    pub fn missing(
        kind: impl Into<String>,
        key: impl Into<String>,
        prerequisite: impl Into<String>,
    ) -> Self {
        Self::ResourceMissing {
            kind: kind.into(),
            key: key.into(),
            prerequisite: prerequisite.into(),
        }
    }

    /// Creates a configure-failed error.
    #[must_use]
    pub fn configure_failed(
        kind: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConfigureFailed {
            kind: kind.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_round_trip_keeps_taxonomy() {
        let original = ConvergentError::Adapter(AdapterError::missing(
            "registry.value",
            "HKLM\\Software\\Acme\\Version",
            "registry key HKLM\\Software\\Acme",
        ));

        let rebuilt = original.to_remote().into_error();
        match rebuilt {
            ConvergentError::Adapter(AdapterError::ResourceMissing { kind, key, prerequisite }) => {
                assert_eq!(kind, "registry.value");
                assert_eq!(key, "HKLM\\Software\\Acme\\Version");
                assert_eq!(prerequisite, "registry key HKLM\\Software\\Acme");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unclassified_errors_become_job_failures() {
        let failure = ConvergentError::internal("boom").to_remote();
        assert_eq!(failure.code, ErrorCode::Failed);
        assert!(matches!(
            failure.into_error(),
            ConvergentError::Channel(ChannelError::JobFailed { .. })
        ));
    }

    #[test]
    fn test_wire_errors_keep_their_code() {
        let original = ConvergentError::Wire(WireError::UnexpectedEof {
            needed: 4,
            remaining: 1,
        });
        let failure = original.to_remote();
        assert_eq!(failure.code, ErrorCode::Deserialization);

        match failure.into_error() {
            ConvergentError::Wire(WireError::Remote { message }) => {
                assert!(message.contains("needed 4 bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_classification() {
        assert!(ConvergentError::Channel(ChannelError::Cancelled).is_cancelled());
        assert!(ConvergentError::Channel(ChannelError::unavailable("refused")).is_transport());
        assert!(!ConvergentError::internal("x").is_transport());
        assert_eq!(
            ConvergentError::Script(ScriptError::NonZeroExit { exit_code: 3 })
                .to_remote()
                .exit_code,
            3
        );
    }
}
