//! External execution client
//!
//! A [`ClientHandle`] is the connection to the engine that runs check commands. Provisioning one
//! probes the engine, which is slow, so the invocation context creates it at most once and every
//! leaf borrows it. Leaves derive short-lived [`Container`]s from the shared handle.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command as ProcessCommand;
use uuid::Uuid;

/// Mount point of the working directory inside docker containers
const CONTAINER_WORKDIR: &str = "/src";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{engine} engine is unavailable: {reason}")]
    EngineUnavailable { engine: Engine, reason: String },
    #[error("Working directory does not exist: {0}")]
    WorkdirNotFound(PathBuf),
    #[error("Unable to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Backend used to run check commands
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Run each check inside a throwaway docker container
    #[default]
    Docker,
    /// Run commands directly with `sh -c` in the working directory
    Local,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Docker => write!(f, "docker"),
            Engine::Local => write!(f, "local"),
        }
    }
}

/// Creates client handles. Called at most once per invocation by
/// [`LazyClientProvider`](crate::context::LazyClientProvider).
pub trait ClientFactory {
    /// Provision a new client for the pipeline called `name`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError` if the engine cannot be reached.
    fn create<'a>(&'a self, name: &'a str) -> LocalBoxFuture<'a, Result<ClientHandle, ClientError>>;
}

/// Factory for the built-in engines
#[derive(Debug, Clone)]
pub struct EngineFactory {
    engine: Engine,
    workdir: PathBuf,
}

impl EngineFactory {
    #[must_use]
    pub fn new(engine: Engine, workdir: PathBuf) -> Self {
        Self { engine, workdir }
    }
}

impl ClientFactory for EngineFactory {
    fn create<'a>(&'a self, name: &'a str) -> LocalBoxFuture<'a, Result<ClientHandle, ClientError>> {
        Box::pin(async move {
            let workdir = self
                .workdir
                .canonicalize()
                .map_err(|_| ClientError::WorkdirNotFound(self.workdir.clone()))?;
            if !workdir.is_dir() {
                return Err(ClientError::WorkdirNotFound(workdir));
            }
            if self.engine == Engine::Docker {
                probe_docker().await?;
            }
            let handle = ClientHandle::new(self.engine, workdir, name);
            info!(
                "Provisioned {} client for '{name}' (session {})",
                handle.engine,
                handle.session
            );
            Ok(handle)
        })
    }
}

async fn probe_docker() -> Result<(), ClientError> {
    let output = ProcessCommand::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ClientError::EngineUnavailable {
            engine: Engine::Docker,
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(ClientError::EngineUnavailable {
            engine: Engine::Docker,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    debug!(
        "Docker server version {}",
        String::from_utf8_lossy(&output.stdout).trim()
    );
    Ok(())
}

/// Shared connection to an execution engine
#[derive(Debug)]
pub struct ClientHandle {
    engine: Engine,
    workdir: PathBuf,
    pipeline: String,
    session: Uuid,
}

impl ClientHandle {
    #[must_use]
    pub fn new(engine: Engine, workdir: PathBuf, pipeline: impl Into<String>) -> Self {
        Self {
            engine,
            workdir,
            pipeline: pipeline.into(),
            session: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        self.engine
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Name of the pipeline this client was provisioned for
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    #[must_use]
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Start a container scoped to one check. The container is not shared with other checks.
    ///
    /// # Errors
    ///
    /// Returns `ClientError` if the container cannot be started.
    pub async fn container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<Container<'_>, ClientError> {
        let id = match self.engine {
            Engine::Local => None,
            Engine::Docker => {
                let output = ProcessCommand::new("docker")
                    .args(self.docker_run_args(name, spec))
                    .stdin(Stdio::null())
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(ClientError::EngineUnavailable {
                        engine: Engine::Docker,
                        reason: format!(
                            "unable to start {}: {}",
                            spec.image,
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                    });
                }
                let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
                debug!("Started container {id} for '{name}' from {}", spec.image);
                Some(id)
            }
        };
        Ok(Container {
            client: self,
            id,
            env: spec.env.clone(),
        })
    }

    pub(crate) fn docker_run_args(&self, name: &str, spec: &ContainerSpec) -> Vec<String> {
        let session = self.session.simple().to_string();
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            format!("formatci-{name}-{}", &session[..8]),
            "--label".to_string(),
            format!("formatci.session={session}"),
            "--volume".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", self.workdir.display()),
            "--workdir".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            spec.image.clone(),
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]);
        args
    }
}

/// What a check needs from its container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub env: HashMap<String, String>,
}

/// Result of executing a single command with captured output.
#[derive(Debug)]
pub struct ExecResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// A running environment borrowed from a [`ClientHandle`]
pub struct Container<'a> {
    client: &'a ClientHandle,
    id: Option<String>,
    env: HashMap<String, String>,
}

impl Container<'_> {
    /// Run `cmd` through `sh -c`, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Spawn` if the process cannot be started.
    pub async fn exec(&self, cmd: &str) -> Result<ExecResult, ClientError> {
        let mut process = match &self.id {
            Some(id) => {
                let mut process = ProcessCommand::new("docker");
                process.args(["exec", id.as_str(), "sh", "-c", cmd]);
                process
            }
            None => {
                let mut process = ProcessCommand::new("sh");
                process
                    .arg("-c")
                    .arg(cmd)
                    .current_dir(&self.client.workdir)
                    .envs(&self.env);
                process
            }
        };
        debug!("Executing '{cmd}' ({})", self.client.engine);

        let start = Instant::now();
        let output = process.stdin(Stdio::null()).output().await?;
        Ok(ExecResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }

    /// Tear the container down. Local containers have nothing to stop.
    pub async fn stop(self) {
        let Some(id) = self.id else {
            return;
        };
        let result = ProcessCommand::new("docker")
            .args(["rm", "--force", id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!("Removed container {id}"),
            Ok(status) => warn!("Removing container {id} exited with {status}"),
            Err(e) => warn!("Unable to remove container {id}: {e}"),
        }
    }
}
