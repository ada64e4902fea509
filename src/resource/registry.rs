//! Registry keys and values.

use serde::{Deserialize, Serialize};

use crate::compare::{Case, FieldComparer};
use crate::error::{ConvergentError, Result};
use crate::job::wire::{wire_enum, wire_record};

use super::any::AnyTemplate;
use super::kind::ResourceKind;
use super::service::default_exists;
use super::template::{key_part, pick, require, Prerequisite, Resource};

/// Root hives and their short aliases.
const HIVES: [(&str, &str); 5] = [
    ("HKEY_LOCAL_MACHINE", "HKLM"),
    ("HKEY_CURRENT_USER", "HKCU"),
    ("HKEY_CLASSES_ROOT", "HKCR"),
    ("HKEY_USERS", "HKU"),
    ("HKEY_CURRENT_CONFIG", "HKCC"),
];

/// Normalizes a key path to `HKLM\sub\key` with the short hive alias and no
/// trailing separator. Returns `None` when the hive is not recognized.
fn canonical_path(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_end_matches('\\');
    let (hive, rest) = trimmed.split_once('\\').unwrap_or((trimmed, ""));
    let short = HIVES
        .iter()
        .find(|(long, short)| hive.eq_ignore_ascii_case(long) || hive.eq_ignore_ascii_case(short))
        .map(|(_, short)| *short)?;

    if rest.is_empty() {
        Some(short.to_string())
    } else {
        Some(format!("{short}\\{rest}"))
    }
}

fn validate_path(kind: ResourceKind, path: &str) -> Result<()> {
    require(kind, "path", path)?;
    if canonical_path(path).is_none() {
        return Err(ConvergentError::invalid_template(
            kind.type_name(),
            "path",
            format!("'{path}' does not start with a registry hive"),
        ));
    }
    Ok(())
}

fn path_key(path: &str) -> String {
    key_part(&canonical_path(path).unwrap_or_else(|| path.to_string()))
}

/// A registry key, identified by its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryKey {
    /// Full key path, e.g. `HKLM\Software\Acme`.
    pub path: String,
    /// Whether the key exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
}

wire_record!(RegistryKey { exists, path });

impl RegistryKey {
    /// Creates a template requiring the key to exist.
    #[must_use]
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exists: true,
        }
    }
}

impl Resource for RegistryKey {
    const KIND: ResourceKind = ResourceKind::RegistryKey;

    fn configuration_key(&self) -> String {
        path_key(&self.path)
    }

    fn validate(&self) -> Result<()> {
        validate_path(Self::KIND, &self.path)
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn absent(&self) -> Self {
        Self {
            path: self.path.clone(),
            exists: false,
        }
    }

    fn compare_fields(&self, _actual: &Self, _comparer: &mut FieldComparer) {}

    fn overlay(&self, _current: Option<&Self>) -> Self {
        self.clone()
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::RegistryKey(self)
    }
}

/// Data type of a registry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValueKind {
    /// A string.
    String,
    /// A string with environment references.
    ExpandString,
    /// A list of strings.
    MultiString,
    /// A 32-bit number.
    DWord,
    /// A 64-bit number.
    QWord,
    /// Hex-encoded bytes.
    Binary,
}

wire_enum!(RegistryValueKind {
    String = 0,
    ExpandString = 1,
    MultiString = 2,
    DWord = 3,
    QWord = 4,
    Binary = 5,
});

impl std::fmt::Display for RegistryValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "String",
            Self::ExpandString => "ExpandString",
            Self::MultiString => "MultiString",
            Self::DWord => "DWord",
            Self::QWord => "QWord",
            Self::Binary => "Binary",
        };
        write!(f, "{s}")
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// A named value under a registry key. An empty name is the key's default
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValue {
    /// Path of the owning key.
    pub path: String,
    /// Value name.
    #[serde(default)]
    pub name: String,
    /// Whether the value exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Data type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_kind: Option<RegistryValueKind>,
    /// Data; a single element except for `MultiString`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<String>>,
}

wire_record!(RegistryValue {
    exists,
    value_kind,
    path,
    name,
    data,
});

impl RegistryValue {
    /// Data in comparable form: numbers are rendered in decimal.
    fn normalized_data(&self) -> Option<Vec<String>> {
        let data = self.data.as_ref()?;
        match self.value_kind {
            Some(RegistryValueKind::DWord | RegistryValueKind::QWord) => Some(
                data.iter()
                    .map(|d| parse_number(d).map_or_else(|| d.clone(), |n| n.to_string()))
                    .collect(),
            ),
            Some(RegistryValueKind::Binary) => Some(data.iter().map(|d| d.to_lowercase()).collect()),
            _ => Some(data.clone()),
        }
    }

    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(default)"
        } else {
            &self.name
        }
    }
}

impl Resource for RegistryValue {
    const KIND: ResourceKind = ResourceKind::RegistryValue;

    fn configuration_key(&self) -> String {
        format!("{}\\{}", path_key(&self.path), key_part(self.display_name()))
    }

    fn validate(&self) -> Result<()> {
        validate_path(Self::KIND, &self.path)?;

        let (Some(kind), Some(data)) = (self.value_kind, self.data.as_ref()) else {
            return Ok(());
        };
        if kind != RegistryValueKind::MultiString && data.len() != 1 {
            return Err(ConvergentError::invalid_template(
                Self::KIND.type_name(),
                "data",
                format!("{kind} values take exactly one element, got {}", data.len()),
            ));
        }
        match kind {
            RegistryValueKind::DWord => {
                if !data.iter().all(|d| parse_number(d).is_some_and(|n| u32::try_from(n).is_ok())) {
                    return Err(ConvergentError::invalid_template(
                        Self::KIND.type_name(),
                        "data",
                        "DWord data must be a 32-bit number",
                    ));
                }
            }
            RegistryValueKind::QWord => {
                if !data.iter().all(|d| parse_number(d).is_some()) {
                    return Err(ConvergentError::invalid_template(
                        Self::KIND.type_name(),
                        "data",
                        "QWord data must be a 64-bit number",
                    ));
                }
            }
            RegistryValueKind::Binary => {
                if !data.iter().all(|d| hex::decode(d.trim()).is_ok()) {
                    return Err(ConvergentError::invalid_template(
                        Self::KIND.type_name(),
                        "data",
                        "Binary data must be hex-encoded",
                    ));
                }
            }
            RegistryValueKind::String
            | RegistryValueKind::ExpandString
            | RegistryValueKind::MultiString => {}
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn absent(&self) -> Self {
        Self {
            path: self.path.clone(),
            name: self.name.clone(),
            exists: false,
            value_kind: None,
            data: None,
        }
    }

    fn compare_fields(&self, actual: &Self, comparer: &mut FieldComparer) {
        comparer.text(
            "Name",
            Some(self.display_name()),
            Some(actual.display_name()),
            Case::Insensitive,
        );
        comparer.value("ValueKind", self.value_kind.as_ref(), actual.value_kind.as_ref());
        comparer.sequence(
            "Data",
            self.normalized_data().as_deref(),
            actual.normalized_data().as_deref(),
        );
    }

    fn overlay(&self, current: Option<&Self>) -> Self {
        if !self.exists {
            return self.absent();
        }
        let base = current.cloned().unwrap_or_else(|| self.absent());
        Self {
            path: self.path.clone(),
            name: self.name.clone(),
            exists: true,
            value_kind: pick(self.value_kind.as_ref(), base.value_kind.as_ref()),
            data: pick(self.data.as_ref(), base.data.as_ref()),
        }
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        vec![Prerequisite {
            kind: ResourceKind::RegistryKey,
            key: path_key(&self.path),
        }]
    }

    fn into_any(self) -> AnyTemplate {
        AnyTemplate::RegistryValue(self)
    }
}
