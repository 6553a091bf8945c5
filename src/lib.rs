//! Core implementation of formatci
//!
//! formatci runs code format checks inside containers. Checks are leaves of a command tree:
//! groups parse their own options into a shared [`InvocationContext`], then dispatch to the
//! selected child or run every child in turn. The external client that executes the checks is
//! provisioned once per invocation and shared by every leaf.

use std::ffi::OsString;
use std::path::PathBuf;

use log::debug;

use crate::checks::{CheckDef, builtin_checks, merge_checks, root_group};
use crate::client::Engine;
use crate::commands::{CommandNode, DispatchError, Outcome};
use crate::config_file::{Config, ConfigError, inherit_path};
use crate::context::InvocationContext;

pub mod checks;
pub mod client;
pub mod commands;
pub mod config_file;
pub mod context;
pub mod logger;
pub mod report;

/// Everything needed to build the command tree and its client
#[derive(Debug)]
pub struct Settings {
    pub engine: Engine,
    pub workdir: PathBuf,
    pub checks: Vec<CheckDef>,
    /// Config file the settings were read from, if any
    pub config_path: Option<PathBuf>,
}

/// Load settings from a config file, or auto-detect one from the current directory.
///
/// Without a config file the built-in checks run against the current directory.
///
/// # Errors
///
/// Returns `ConfigError` if an explicit config file is missing, a config file cannot be
/// parsed, or it contains invalid checks.
pub fn load_settings(config_file: Option<&str>) -> Result<Settings, ConfigError> {
    let cwd =
        std::env::current_dir().map_err(|e| ConfigError::UnknownWorkingDirectory(e.to_string()))?;
    let config_path = match config_file {
        Some(file) => {
            let config_path = PathBuf::from(file);
            if !config_path.exists() {
                return Err(ConfigError::ConfigNotFound(config_path));
            }
            Some(config_path)
        }
        None => match Config::find_config(&cwd) {
            Ok(path) => Some(path),
            Err(ConfigError::ConfigNotFound(_)) => None,
            Err(e) => return Err(e),
        },
    };

    let Some(config_path) = config_path else {
        debug!("No config file, using built-in checks in {}", cwd.display());
        return Ok(Settings {
            engine: Engine::default(),
            workdir: cwd,
            checks: builtin_checks(),
            config_path: None,
        });
    };

    let config_dir = config_path
        .parent()
        .map(|dir| inherit_path(&cwd, dir.to_path_buf()))
        .unwrap_or_else(|| cwd.clone());
    let mut config = Config::from_file(&config_path)?;
    let checks = merge_checks(builtin_checks(), config.check_defs()?);
    debug!(
        "Loaded {} checks from {} (workdir base: {})",
        checks.len(),
        config_path.display(),
        config_dir.display()
    );
    Ok(Settings {
        engine: config.engine.unwrap_or_default(),
        workdir: inherit_path(&config_dir, config.workdir.take().unwrap_or_default()),
        checks,
        config_path: Some(config_path),
    })
}

/// Build the root command tree for `checks`
#[must_use]
pub fn command_tree(checks: Vec<CheckDef>) -> CommandNode {
    root_group(checks).into()
}

/// Run `argv` (without the program name) through `root`.
///
/// # Errors
///
/// Returns `DispatchError` if dispatch is aborted before an outcome is reached.
pub async fn invoke(
    root: &mut CommandNode,
    ctx: &mut InvocationContext,
    argv: Vec<OsString>,
) -> Result<Outcome, DispatchError> {
    debug!("Invoking '{}' with {argv:?}", root.name());
    root.execute(ctx, argv).await
}
