use std::collections::BTreeSet;
use std::fmt::Display;

use crate::resource::ports::PortSet;

use super::difference::{ComparisonResult, Difference};

/// Rendering for a value the actual state does not carry.
const UNSET: &str = "(unset)";

/// Whether text comparisons respect case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    /// `Spooler` and `spooler` differ.
    Sensitive,
    /// `Spooler` and `spooler` are equal.
    Insensitive,
}

/// Accumulates differences field by field.
///
/// Every method skips the field when the desired value is `None`: an
/// unspecified field is never compared.
#[derive(Debug, Default)]
pub struct FieldComparer {
    differences: Vec<Difference>,
}

impl FieldComparer {
    /// Creates an empty comparer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            differences: Vec::new(),
        }
    }

    /// Returns the accumulated result.
    #[must_use]
    pub fn finish(self) -> ComparisonResult {
        ComparisonResult {
            differences: self.differences,
        }
    }

    /// Compares a scalar string. A missing actual value compares as empty.
    ///
    /// Insensitive comparisons also ignore surrounding whitespace, matching
    /// how configuration keys are normalized.
    pub fn text(&mut self, field: &str, desired: Option<&str>, actual: Option<&str>, case: Case) {
        let Some(desired) = desired else {
            return;
        };
        let actual_text = actual.unwrap_or_default();
        let equal = match case {
            Case::Sensitive => desired == actual_text,
            Case::Insensitive => desired.trim().to_lowercase() == actual_text.trim().to_lowercase(),
        };
        if !equal {
            self.push(field, desired.to_string(), render_text(actual));
        }
    }

    /// Compares a typed value such as an enumeration, a flag or a number.
    pub fn value<T>(&mut self, field: &str, desired: Option<&T>, actual: Option<&T>)
    where
        T: PartialEq + Display + ?Sized,
    {
        let Some(desired) = desired else {
            return;
        };
        if actual != Some(desired) {
            let rendered = actual.map_or_else(|| UNSET.to_string(), ToString::to_string);
            self.push(field, desired.to_string(), rendered);
        }
    }

    /// Compares two collections as sets: order and duplicates are ignored.
    pub fn set(&mut self, field: &str, desired: Option<&[String]>, actual: Option<&[String]>, case: Case) {
        let Some(desired) = desired else {
            return;
        };
        let actual = actual.unwrap_or_default();
        if normalize_set(desired.iter().map(String::as_str), case)
            != normalize_set(actual.iter().map(String::as_str), case)
        {
            self.push(field, desired.join(", "), actual.join(", "));
        }
    }

    /// Compares comma-delimited lists as sets, e.g. `Domain,Private`.
    pub fn delimited_set(
        &mut self,
        field: &str,
        desired: Option<&str>,
        actual: Option<&str>,
        case: Case,
    ) {
        let Some(desired) = desired else {
            return;
        };
        let actual_text = actual.unwrap_or_default();
        if normalize_set(desired.split(','), case) != normalize_set(actual_text.split(','), case) {
            self.push(field, desired.to_string(), render_text(actual));
        }
    }

    /// Compares two collections element by element, order included.
    pub fn sequence(&mut self, field: &str, desired: Option<&[String]>, actual: Option<&[String]>) {
        let Some(desired) = desired else {
            return;
        };
        let actual = actual.unwrap_or_default();
        if desired != actual {
            self.push(
                field,
                format!("[{}]", desired.join(", ")),
                format!("[{}]", actual.join(", ")),
            );
        }
    }

    /// Compares port lists after expanding ranges, so `80-81,443` equals
    /// `443,80,81`.
    pub fn port_set(&mut self, field: &str, desired: Option<&str>, actual: Option<&str>) {
        let Some(desired) = desired else {
            return;
        };
        let actual_text = actual.unwrap_or_default();
        let equal = match (PortSet::parse(desired), PortSet::parse(actual_text)) {
            (Ok(d), Ok(a)) => d == a,
            _ => desired.trim().eq_ignore_ascii_case(actual_text.trim()),
        };
        if !equal {
            self.push(field, desired.to_string(), render_text(actual));
        }
    }

    fn push(&mut self, field: &str, expected: String, actual: String) {
        self.differences.push(Difference {
            field: field.to_string(),
            expected,
            actual,
        });
    }
}

fn render_text(value: Option<&str>) -> String {
    value.map_or_else(|| UNSET.to_string(), str::to_string)
}

fn normalize_set<'a>(items: impl Iterator<Item = &'a str>, case: Case) -> BTreeSet<String> {
    items
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match case {
            Case::Sensitive => item.to_string(),
            Case::Insensitive => item.to_lowercase(),
        })
        .collect()
}
