//! Configuration file handling for formatci

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checks::{CheckDef, DEFAULT_IMAGE};
use crate::client::Engine;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config file found in current directory or its parents: {0}")]
    ConfigNotFound(PathBuf),
    #[error("Unknown working directory: {0}")]
    UnknownWorkingDirectory(String),
    #[error("Unable to parse YAML config file {path}: {source}")]
    Yaml {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("Unable to parse JSON config file {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("Duplicate check in config: {0}")]
    DuplicateCheck(String),
    #[error("Invalid config: {0}")]
    Validation(String),
}

/// Resolve `child` against `parent` unless it is already absolute
#[must_use]
pub fn inherit_path(parent: &Path, child: PathBuf) -> PathBuf {
    if child.as_os_str().is_empty() {
        parent.to_path_buf()
    } else if child.is_relative() {
        parent.join(child)
    } else {
        child
    }
}

/// Check names become subcommands and container names: `[A-Za-z0-9][A-Za-z0-9_.-]*`
fn is_valid_check_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Configuration for a single check
#[derive(Debug, Deserialize, Serialize)]
pub struct ConfigCheck {
    pub name: String,
    pub about: Option<String>,
    pub pipeline: Option<String>,
    pub image: Option<String>,
    pub setup: Option<Vec<String>>,
    pub commands: Vec<String>,
    pub env: Option<HashMap<String, String>>,
}

impl TryFrom<ConfigCheck> for CheckDef {
    type Error = ConfigError;

    fn try_from(config: ConfigCheck) -> Result<Self, Self::Error> {
        if config.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Check with an empty name".to_string(),
            ));
        }
        if !is_valid_check_name(&config.name) {
            return Err(ConfigError::Validation(format!(
                "Check name '{}' may only contain letters, digits, '_', '.' and '-', and must start with a letter or digit",
                config.name
            )));
        }
        if config.commands.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Check '{}' has no commands",
                config.name
            )));
        }
        let setup = config.setup.unwrap_or_default();
        if setup.iter().chain(&config.commands).any(|cmd| cmd.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Check '{}' has an empty command string",
                config.name
            )));
        }
        Ok(CheckDef {
            about: config
                .about
                .unwrap_or_else(|| format!("Run the {} check.", config.name)),
            pipeline: config
                .pipeline
                .unwrap_or_else(|| format!("Check {} formatting", config.name)),
            image: config.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            setup,
            commands: config.commands,
            env: config.env.unwrap_or_default(),
            name: config.name,
        })
    }
}

/// Root configuration structure for formatci
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct Config {
    pub engine: Option<Engine>,
    /// Directory mounted into check containers, relative to the config file
    pub workdir: Option<PathBuf>,
    pub checks: Option<Vec<ConfigCheck>>,
}

/// List of supported configuration file names
const FILENAMES: [&str; 3] = [".formatci.json", ".formatci.yaml", ".formatci.yml"];

impl Config {
    /// Loads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if the file cannot be read, or
    /// `ConfigError::Yaml`/`ConfigError::Json` if parsing fails.
    pub fn from_file(file: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(file)
            .map_err(|_| ConfigError::ConfigNotFound(file.to_path_buf()))?;
        let config: Config = if file.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents).map_err(|e| ConfigError::Json {
                source: e,
                path: file.to_path_buf(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Yaml {
                source: e,
                path: file.to_path_buf(),
            })?
        };
        Ok(config)
    }

    /// Searches for a configuration file in `start` and its parents.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if no config file is found.
    pub fn find_config(start: &Path) -> Result<PathBuf, ConfigError> {
        let mut path = start.to_path_buf();
        debug!("Searching for config file in {}", start.display());
        loop {
            for file in &FILENAMES {
                let config_path = path.join(file);
                if config_path.exists() {
                    info!("Found config file: {}", config_path.display());
                    return Ok(config_path);
                }
            }
            if !path.pop() {
                return Err(ConfigError::ConfigNotFound(start.to_path_buf()));
            }
        }
    }

    /// Convert the configured checks, rejecting duplicate names.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateCheck` or `ConfigError::Validation` for invalid checks.
    pub fn check_defs(&mut self) -> Result<Vec<CheckDef>, ConfigError> {
        let mut seen = HashSet::new();
        self.checks
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|check| {
                if !seen.insert(check.name.clone()) {
                    return Err(ConfigError::DuplicateCheck(check.name));
                }
                CheckDef::try_from(check)
            })
            .collect()
    }
}
