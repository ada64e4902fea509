//! Request, outcome and agent message envelopes.

use zeroize::Zeroizing;

use crate::error::{ErrorCode, RemoteFailure, WireError};

use super::events::JobEvent;
use super::wire::{wire_enum, wire_record, Wire, WireReader, WireWriter};

/// Version of the envelope layout. Bumped on any incompatible change.
pub const PROTOCOL_VERSION: u16 = 1;

wire_enum!(ErrorCode {
    InvalidTemplate = 1,
    AdapterUnavailable = 2,
    ResourceMissing = 3,
    ConfigureFailed = 4,
    Cancelled = 5,
    CredentialNotFound = 6,
    ScriptExit = 7,
    Failed = 8,
    Deserialization = 9,
});

wire_record!(RemoteFailure {
    code,
    exit_code,
    kind,
    key,
    message,
});

/// A job on its way to the agent.
///
/// The payload may carry credential material, so it is zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Job kind the agent dispatches on.
    pub kind: String,
    /// The job encoded with the wire schema.
    pub payload: Zeroizing<Vec<u8>>,
}

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job returned; the payload is its encoded output.
    Completed(Vec<u8>),
    /// The job raised an error.
    Failed(RemoteFailure),
    /// The job observed cancellation.
    Cancelled,
}

/// Everything an agent sends back for one job, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// The agent began executing the job.
    Started,
    /// A log or progress event.
    Event(JobEvent),
    /// The final outcome. Nothing follows it.
    Finished(JobOutcome),
}

impl JobRequest {
    /// Builds a request from an already encoded payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload: Zeroizing::new(payload),
        }
    }
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Wire for JobRequest {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_u16(PROTOCOL_VERSION);
        writer.put_str(&self.kind);
        writer.put_bytes(&self.payload);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let version = reader.get_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }
        let kind = reader.get_string()?;
        let payload = Zeroizing::new(reader.get_bytes()?.to_vec());
        Ok(Self { kind, payload })
    }
}

impl Wire for JobOutcome {
    fn encode(&self, writer: &mut WireWriter) {
        match self {
            Self::Completed(payload) => {
                writer.put_u8(0);
                writer.put_bytes(payload);
            }
            Self::Failed(failure) => {
                writer.put_u8(1);
                failure.encode(writer);
            }
            Self::Cancelled => writer.put_u8(2),
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        match reader.get_u8()? {
            0 => Ok(Self::Completed(reader.get_bytes()?.to_vec())),
            1 => Ok(Self::Failed(RemoteFailure::decode(reader)?)),
            2 => Ok(Self::Cancelled),
            tag => Err(WireError::InvalidTag {
                type_name: "JobOutcome",
                tag,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::wire::{from_bytes, to_bytes};

    #[test]
    fn test_request_header_layout() {
        let request = JobRequest::new("service.collect", vec![9]);
        let bytes = to_bytes(&request).expect("encode");

        assert_eq!(&bytes[..2], &[1, 0]);
        assert_eq!(&bytes[2..6], &[15, 0, 0, 0]);
        assert_eq!(bytes.last(), Some(&9));
    }

    #[test]
    fn test_request_rejects_other_versions() {
        let mut bytes = to_bytes(&JobRequest::new("x", vec![])).expect("encode");
        bytes[0] = 2;

        assert!(matches!(
            from_bytes::<JobRequest>(&bytes),
            Err(WireError::UnsupportedVersion {
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn test_failure_outcome_keeps_taxonomy() {
        let outcome = JobOutcome::Failed(RemoteFailure {
            code: ErrorCode::ScriptExit,
            kind: String::new(),
            key: String::new(),
            message: String::from("exit 3"),
            exit_code: 3,
        });

        let decoded: JobOutcome = from_bytes(&to_bytes(&outcome).expect("encode")).expect("decode");
        assert_eq!(decoded, outcome);
    }

    #[test]
    fn test_debug_hides_payload() {
        let request = JobRequest::new("script.run", b"secret".to_vec());
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("115"));
        assert!(rendered.contains("payload_len: 6"));
    }
}
