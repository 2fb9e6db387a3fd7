//! Configuration loading.
//!
//! Configuration comes from `strata.yaml`, an optional `.env` file and
//! `STRATA_*` environment overrides, applied in that order.

use crate::error::{ConfigError, Result, StrataError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::EngineConfig;

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["strata.yaml", "strata.yml"];

/// Loader for engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving the `.env` file.
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
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StrataError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string. An empty document yields
    /// the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            StrataError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!("Parsed configuration for stack: {}", config.stack.name);
        Ok(config)
    }

    /// Loads configuration for a run.
    ///
    /// An explicit path must exist. Without one, `strata.yaml` is searched
    /// for from `start_dir` upwards and the defaults are used if none is
    /// found. Environment overrides are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed or an override is invalid.
    pub fn load(&self, explicit: Option<&Path>, start_dir: impl AsRef<Path>) -> Result<EngineConfig> {
        self.load_dotenv()?;

        let mut config = match explicit {
            Some(path) => self.load_file(path)?,
            None => match find_config_file(start_dir) {
                Some(path) => self.load_file(path)?,
                None => {
                    debug!("No configuration file found, using defaults");
                    EngineConfig::default()
                }
            },
        };

        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies `STRATA_*` environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEnvVar` if `STRATA_MAX_WORKERS` is not a positive
    /// integer.
    pub fn apply_env_overrides(config: &mut EngineConfig) -> Result<()> {
        apply_overrides(config, |name| std::env::var(name).ok())
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
            dotenvy::from_path(&env_path).map_err(|e| {
                StrataError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn apply_overrides(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(name) = lookup("STRATA_STACK_NAME") {
        debug!("Overriding stack.name from environment");
        config.stack.name = name;
    }
    if let Some(region) = lookup("STRATA_REGION") {
        debug!("Overriding stack.region from environment");
        config.stack.region = region;
    }
    if let Some(account_id) = lookup("STRATA_ACCOUNT_ID") {
        debug!("Overriding stack.account_id from environment");
        config.stack.account_id = account_id;
    }
    if let Some(path) = lookup("STRATA_STATE_PATH") {
        debug!("Overriding state.path from environment");
        config.state.path = path;
    }
    if let Some(value) = lookup("STRATA_MAX_WORKERS") {
        let workers = value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                StrataError::Config(ConfigError::InvalidEnvVar {
                    name: String::from("STRATA_MAX_WORKERS"),
                    value: value.clone(),
                })
            })?;
        debug!("Overriding execution.max_workers from environment");
        config.execution.max_workers = workers;
    }
    Ok(())
}

/// Finds the configuration file in a directory or its parents.
#[must_use]
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Option<PathBuf> {
    let mut current = start_dir.as_ref().to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Some(config_path);
            }
        }

        if !current.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::planner::FailureMode;
    use std::collections::HashMap;

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
stack:
  name: web
  region: eu-west-1
state:
  backend: memory
execution:
  max_workers: 8
  failure_mode: continue-independent
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.stack.name, "web");
        assert_eq!(config.stack.region, "eu-west-1");
        assert_eq!(config.stack.partition, "aws");
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.execution.max_workers, 8);
        assert_eq!(config.execution.failure_mode, FailureMode::ContinueIndependent);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = ConfigParser::new().parse_yaml("  \n", None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_unknown_backend_is_parse_error() {
        let err = ConfigParser::new()
            .parse_yaml("state:\n  backend: s3\n", None)
            .unwrap_err();
        assert!(matches!(err, StrataError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STRATA_STACK_NAME", "prod"),
            ("STRATA_STATE_PATH", "/var/lib/strata"),
            ("STRATA_MAX_WORKERS", "2"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        apply_overrides(&mut config, |name| vars.get(name).map(ToString::to_string)).unwrap();

        assert_eq!(config.stack.name, "prod");
        assert_eq!(config.stack.region, "us-east-1");
        assert_eq!(config.state.path, "/var/lib/strata");
        assert_eq!(config.execution.max_workers, 2);
    }

    #[test]
    fn test_invalid_worker_override() {
        let mut config = EngineConfig::default();
        let err = apply_overrides(&mut config, |name| {
            (name == "STRATA_MAX_WORKERS").then(|| String::from("zero"))
        })
        .unwrap_err();
        assert!(matches!(
            err,
            StrataError::Config(ConfigError::InvalidEnvVar { ref value, .. }) if value == "zero"
        ));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("strata.yml"), "stack:\n  name: found\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("strata.yml"));

        let config = ConfigParser::new().load_file(found).unwrap();
        assert_eq!(config.stack.name, "found");
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = ConfigParser::new()
            .load_file("/nonexistent/strata.yaml")
            .unwrap_err();
        assert!(matches!(err, StrataError::Config(ConfigError::FileNotFound { .. })));
    }
}
