//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationReport;
use crate::reconciler::ReconciliationResult;
use crate::resource::AnyTemplate;
use crate::script::ScriptResult;
use crate::state::{DriftState, DriftStatus};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Reconciliation outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Differences")]
    differences: String,
}

/// Collected resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Exists")]
    exists: String,
}

/// Recorded drift row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Recorded")]
    recorded: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => Self::format_reconciliation_text(result),
        }
    }

    fn format_reconciliation_text(result: &ReconciliationResult) -> String {
        if result.outcomes.is_empty() {
            return format!("{} No resources configured.\n", "✓".green());
        }

        let rows: Vec<OutcomeRow> = result
            .outcomes
            .iter()
            .map(|o| OutcomeRow {
                kind: o.kind.to_string(),
                key: Self::truncate(&o.key, 40),
                status: Self::format_status(o.status),
                differences: o.error.as_ref().map_or_else(
                    || {
                        o.differences
                            .iter()
                            .map(|d| d.field.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    },
                    |e| Self::truncate(e, 40),
                ),
            })
            .collect();

        let mut output = Table::new(rows).to_string();
        output.push('\n');

        let summary = if result.success() {
            format!("{} Reconciliation successful", "✓".green())
        } else {
            format!("{} Reconciliation failed", "✗".red())
        };
        let _ = write!(
            output,
            "\n{summary}: {} in desired state, {} drifted, {} converged, {} not converged, {} failed\n",
            result.count(DriftStatus::InDesiredState),
            result.count(DriftStatus::Drifted).to_string().yellow(),
            result.count(DriftStatus::Converged).to_string().green(),
            result.count(DriftStatus::NotConverged).to_string().red(),
            result.count(DriftStatus::Failed).to_string().red()
        );

        for outcome in &result.outcomes {
            for difference in &outcome.differences {
                let _ = writeln!(output, "   {} '{}': {difference}", outcome.kind, outcome.key);
            }
        }

        output
    }

    /// Formats collected resource states.
    #[must_use]
    pub fn format_collected(&self, resources: &[AnyTemplate]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(resources).unwrap_or_default(),
            OutputFormat::Text => {
                if resources.is_empty() {
                    return String::from("   No resources collected.\n");
                }

                let rows: Vec<ResourceRow> = resources
                    .iter()
                    .map(|r| ResourceRow {
                        kind: r.kind().to_string(),
                        key: Self::truncate(&r.configuration_key(), 50),
                        exists: if r.exists() {
                            "yes".green().to_string()
                        } else {
                            "no".dimmed().to_string()
                        },
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats the result of a script run.
    #[must_use]
    pub fn format_script(&self, name: &str, result: &ScriptResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                if result.skipped {
                    return format!("{} Script '{name}' skipped in simulation.\n", "⚠".yellow());
                }

                let mut output = format!(
                    "{} Script '{name}' exited with {}\n",
                    "✓".green(),
                    result.exit_code
                );
                for value in &result.outputs {
                    let _ = writeln!(output, "   {value}");
                }
                output
            }
        }
    }

    /// Formats recorded drift state.
    #[must_use]
    pub fn format_drift_state(&self, state: &DriftState, attention_only: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nDrift state (version {})", state.version);
                let _ = writeln!(output, "   Last updated: {}\n", state.last_updated);

                let records: Vec<_> = if attention_only {
                    state.attention().collect()
                } else {
                    state.iter().collect()
                };

                if records.is_empty() {
                    output.push_str("   Nothing to show.\n");
                    return output;
                }

                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|r| RecordRow {
                        resource: Self::truncate(&r.slot(), 50),
                        status: Self::format_status(r.status),
                        fingerprint: r.fingerprint.chars().take(8).collect(),
                        recorded: r.recorded_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();

                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                for record in records.iter().filter(|r| r.error.is_some()) {
                    let _ = writeln!(
                        output,
                        "   {} {}: {}",
                        "✗".red(),
                        record.slot(),
                        record.error.as_deref().unwrap_or_default()
                    );
                }
                output
            }
        }
    }

    /// Formats a validation report.
    #[must_use]
    pub fn format_validation(&self, report: &ValidationReport, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": report.is_valid(),
                    "errors": report.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": report.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if report.is_valid() {
                    format!("{} Configuration is valid!\n", "✓".green())
                } else {
                    let mut output = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &report.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                    output
                };

                if show_warnings && !report.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &report.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a drift status with color.
    fn format_status(status: DriftStatus) -> String {
        let label = status.to_string();
        match status {
            DriftStatus::InDesiredState => label.green().to_string(),
            DriftStatus::Converged => label.cyan().to_string(),
            DriftStatus::Drifted => label.yellow().to_string(),
            DriftStatus::NotConverged | DriftStatus::Failed => label.red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", "✓".green().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", "⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, marker: String, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }
}
