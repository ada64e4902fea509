//! Persisted drift status.
//!
//! Only the latest status of each configuration key is kept; there is no
//! history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compare::Difference;
use crate::resource::ResourceKind;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Outcome of the last reconciliation of one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Collected state matched the template.
    InDesiredState,
    /// Drift was found and left alone (test or simulation).
    Drifted,
    /// Drift was corrected and the re-collect matched.
    Converged,
    /// Configure ran but the re-collect still differed.
    NotConverged,
    /// The reconciliation failed.
    Failed,
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::InDesiredState => "in desired state",
            Self::Drifted => "drifted",
            Self::Converged => "converged",
            Self::NotConverged => "not converged",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Latest status of one configuration key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftRecord {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Configuration key.
    pub key: String,
    /// Status.
    pub status: DriftStatus,
    /// Fingerprint of the template that was reconciled.
    pub fingerprint: String,
    /// Differences found before any configure.
    #[serde(default)]
    pub differences: Vec<Difference>,
    /// Error message for failed reconciliations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the status was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl DriftRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        kind: ResourceKind,
        key: impl Into<String>,
        status: DriftStatus,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            key: key.into(),
            status,
            fingerprint: fingerprint.into(),
            differences: Vec::new(),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// Attaches the differences found.
    #[must_use]
    pub fn with_differences(mut self, differences: Vec<Difference>) -> Self {
        self.differences = differences;
        self
    }

    /// Attaches an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Key this record is stored under: `<kind>/<configuration key>`.
    #[must_use]
    pub fn slot(&self) -> String {
        slot(self.kind, &self.key)
    }
}

fn slot(kind: ResourceKind, key: &str) -> String {
    format!("{}/{key}", kind.type_name())
}

/// All persisted drift records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftState {
    /// State format version.
    pub version: String,
    /// Records keyed by `<kind>/<configuration key>`.
    #[serde(default)]
    pub records: BTreeMap<String, DriftRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
}

impl Default for DriftState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl DriftState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record`, replacing the previous status of its key.
    pub fn upsert(&mut self, record: DriftRecord) {
        self.last_updated = record.recorded_at;
        self.records.insert(record.slot(), record);
    }

    /// Returns the status of one configuration key.
    #[must_use]
    pub fn get(&self, kind: ResourceKind, key: &str) -> Option<&DriftRecord> {
        self.records.get(&slot(kind, key))
    }

    /// Removes the status of one configuration key.
    pub fn remove(&mut self, kind: ResourceKind, key: &str) -> Option<DriftRecord> {
        self.records.remove(&slot(kind, key))
    }

    /// Records in key order.
    pub fn iter(&self) -> impl Iterator<Item = &DriftRecord> {
        self.records.values()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records whose status is not `InDesiredState` or `Converged`.
    pub fn attention(&self) -> impl Iterator<Item = &DriftRecord> {
        self.iter()
            .filter(|r| !matches!(r.status, DriftStatus::InDesiredState | DriftStatus::Converged))
    }
}
