//! Loading of run configurations and agent inventories.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConvergentError, Result};
use crate::resource::AnyTemplate;

use super::spec::RunConfig;

/// Environment variable overriding `agent.address`.
pub const ENV_AGENT_ADDRESS: &str = "CONVERGENT_AGENT_ADDRESS";

/// Environment variable overriding `state.path`.
pub const ENV_STATE_PATH: &str = "CONVERGENT_STATE_PATH";

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["convergent.yaml", "convergent.yml"];

/// Loads [`RunConfig`] files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    base_path: Option<PathBuf>,
}

fn parse_error(message: String, source: Option<&Path>) -> ConvergentError {
    ConvergentError::Config(ConfigError::ParseError {
        message,
        location: source.map(|p| p.display().to_string()),
    })
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ConvergentError::Config(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }));
    }
    std::fs::read_to_string(path).map_err(|e| parse_error(format!("Failed to read file: {e}"), Some(path)))
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory `.env` is loaded from.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<RunConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = read_file(path)?;
        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<RunConfig> {
        let config: RunConfig = serde_yaml::from_str(content)
            .map_err(|e| parse_error(format!("YAML parse error: {e}"), source))?;

        debug!(
            "Parsed configuration with {} resource(s) and {} script(s)",
            config.resources.len(),
            config.scripts.len()
        );
        Ok(config)
    }

    /// Loads configuration and applies `CONVERGENT_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<RunConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env_overrides(config: &mut RunConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup(ENV_AGENT_ADDRESS) {
            debug!("Overriding agent.address from environment");
            config.agent.address = address;
        }

        if let Some(path) = lookup(ENV_STATE_PATH) {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path)
                .map_err(|e| parse_error(format!("Failed to load .env file: {e}"), Some(&env_path)))?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Loads an agent inventory: a YAML list of templates describing the
    /// host's initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_inventory(&self, path: impl AsRef<Path>) -> Result<Vec<AnyTemplate>> {
        let path = path.as_ref();
        info!("Loading inventory from: {}", path.display());

        let content = read_file(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| parse_error(format!("YAML parse error: {e}"), Some(path)))
    }
}

/// Finds the configuration file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = config_dir.join("convergent").join(filename);
            if config_path.exists() {
                info!("Using user configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }
    }

    Err(ConvergentError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
