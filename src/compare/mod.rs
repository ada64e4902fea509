//! Field-level comparison of desired and actual resource states.

mod comparer;
mod difference;

pub use comparer::{Case, FieldComparer};
pub use difference::{ComparisonResult, Difference};

use crate::resource::Resource;

/// Field name used when the two sides disagree on existence.
pub const EXISTS_FIELD: &str = "Exists";

/// Compares a desired template with the collected actual state.
///
/// When the two sides disagree on existence only that difference is
/// reported. When both exist, every field the template specifies is
/// compared in declaration order. Two absent resources are equal.
#[must_use]
pub fn compare<R: Resource>(desired: &R, actual: &R) -> ComparisonResult {
    let mut comparer = FieldComparer::new();

    if desired.exists() != actual.exists() {
        comparer.value(EXISTS_FIELD, Some(&desired.exists()), Some(&actual.exists()));
        return comparer.finish();
    }

    if desired.exists() {
        desired.compare_fields(actual, &mut comparer);
    }
    comparer.finish()
}
