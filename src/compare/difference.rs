use serde::{Deserialize, Serialize};

use crate::job::wire::wire_record;

/// A single disagreement between desired and actual state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    /// Field name, e.g. `StartMode`.
    pub field: String,
    /// Desired value, rendered for display.
    pub expected: String,
    /// Actual value, rendered for display.
    pub actual: String,
}

wire_record!(Difference {
    field,
    expected,
    actual,
});

/// Ordered list of differences. Empty means the resource is in the desired
/// state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Differences in field declaration order.
    pub differences: Vec<Difference>,
}

wire_record!(ComparisonResult { differences });

impl ComparisonResult {
    /// Returns true if no differences were found.
    #[must_use]
    pub fn are_equal(&self) -> bool {
        self.differences.is_empty()
    }

    /// Returns the number of differences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.differences.len()
    }

    /// Returns true if there are no differences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    /// Iterates over the differences.
    pub fn iter(&self) -> std::slice::Iter<'_, Difference> {
        self.differences.iter()
    }

    /// Returns the difference for a field, if any.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Difference> {
        self.differences.iter().find(|d| d.field == name)
    }
}

impl<'a> IntoIterator for &'a ComparisonResult {
    type Item = &'a Difference;
    type IntoIter = std::slice::Iter<'a, Difference>;

    fn into_iter(self) -> Self::IntoIter {
        self.differences.iter()
    }
}

impl std::fmt::Display for Difference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: expected '{}', found '{}'",
            self.field, self.expected, self.actual
        )
    }
}

impl std::fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.are_equal() {
            return write!(f, "In desired state");
        }
        writeln!(f, "{} difference(s):", self.len())?;
        for difference in &self.differences {
            writeln!(f, "  {difference}")?;
        }
        Ok(())
    }
}
