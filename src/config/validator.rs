//! Validation of run configurations before anything is sent to an agent.

use std::collections::HashSet;

use tracing::debug;
use validator::Validate;

use crate::error::{ConfigError, ConvergentError, Result};

use super::spec::{RunConfig, ScriptDefinition};

/// Everything found while validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Errors, in the order they were found.
    pub errors: Vec<ConvergentError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Returns true if no errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates [`RunConfig`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates `config` and fails on the first error found.
    ///
    /// # Errors
    ///
    /// Returns the first error: `InvalidTemplate` for a bad template,
    /// `DuplicateKey` for two templates with the same identity, or a
    /// validation error for settings and scripts.
    pub fn validate(&self, config: &RunConfig) -> Result<Vec<String>> {
        let mut report = self.check(config);
        if report.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(report.warnings)
        } else {
            Err(report.errors.remove(0))
        }
    }

    /// Validates `config` and collects every problem.
    #[must_use]
    pub fn check(&self, config: &RunConfig) -> ValidationReport {
        let mut report = ValidationReport::default();

        Self::check_agent(config, &mut report);
        Self::check_resources(config, &mut report);
        Self::check_scripts(config, &mut report);

        if config.resources.is_empty() && config.scripts.is_empty() {
            report
                .warnings
                .push(String::from("Configuration declares no resources and no scripts"));
        }

        report
    }

    fn check_agent(config: &RunConfig, report: &mut ValidationReport) {
        let Err(errors) = config.agent.validate() else {
            return;
        };

        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        for (field, field_errors) in fields {
            for error in field_errors {
                let message = error
                    .message
                    .as_ref()
                    .map_or_else(|| format!("Invalid value ({})", error.code), ToString::to_string);
                report
                    .errors
                    .push(ConfigError::validation(message, format!("agent.{field}")).into());
            }
        }
    }

    fn check_resources(config: &RunConfig, report: &mut ValidationReport) {
        let mut seen = HashSet::new();

        for template in &config.resources {
            if let Err(e) = template.validate() {
                report.errors.push(e);
                continue;
            }

            let kind = template.kind();
            let key = template.configuration_key();
            if !seen.insert((kind, key.clone())) {
                report.errors.push(
                    ConfigError::DuplicateKey {
                        kind: kind.type_name().to_string(),
                        key,
                    }
                    .into(),
                );
                continue;
            }

            if let Some(name) = template.credential_name() {
                if name.trim().is_empty() {
                    report.errors.push(
                        ConfigError::validation(
                            format!("{} names an empty credential", template.describe()),
                            "resources.credential",
                        )
                        .into(),
                    );
                }
            }
        }
    }

    fn check_scripts(config: &RunConfig, report: &mut ValidationReport) {
        for (name, script) in &config.scripts {
            Self::check_script(name, script, report);
        }
    }

    fn check_script(name: &str, script: &ScriptDefinition, report: &mut ValidationReport) {
        let field = format!("scripts.{name}");

        if script.body.trim().is_empty() {
            report
                .errors
                .push(ConfigError::validation("Script body cannot be empty", field.clone()).into());
        }

        for variable in script.variables.keys() {
            if !is_variable_name(variable) {
                report.errors.push(
                    ConfigError::validation(
                        format!("'{variable}' is not a valid environment variable name"),
                        format!("{field}.variables"),
                    )
                    .into(),
                );
            }
        }

        if script.credential.as_deref().is_some_and(|c| c.trim().is_empty()) {
            report.errors.push(
                ConfigError::validation("Credential name cannot be empty", format!("{field}.credential"))
                    .into(),
            );
        }

        if script.run_in_simulation {
            report
                .warnings
                .push(format!("Script '{name}' also runs in simulation mode"));
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
