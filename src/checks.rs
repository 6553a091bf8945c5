//! Format checks and the command tree that runs them

use std::collections::HashMap;

use clap::{Arg, ArgAction, ArgMatches};
use futures::future::LocalBoxFuture;
use log::debug;

use crate::client::{Container, ContainerSpec, Engine, ExecResult};
use crate::commands::{
    CommandNode, DispatchError, FAIL_FAST, Group, LIST_ERRORS, Leaf, LeafAction, Outcome,
};
use crate::context::InvocationContext;

/// Image used by configured checks that do not name one
pub const DEFAULT_IMAGE: &str = "alpine:3.19";

/// Arg id of a check's `--image` override
const IMAGE: &str = "image";

/// A format check: an image, optional setup, and the commands that must all succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDef {
    pub name: String,
    pub about: String,
    /// Name the external client is provisioned under
    pub pipeline: String,
    pub image: String,
    /// Commands run before the checks. Skipped by the local engine.
    pub setup: Vec<String>,
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
}

impl CheckDef {
    fn builtin(name: &str, about: &str, pipeline: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            about: about.to_string(),
            pipeline: pipeline.to_string(),
            image: image.to_string(),
            setup: Vec::new(),
            commands: Vec::new(),
            env: HashMap::new(),
        }
    }

    fn setup(mut self, commands: &[&str]) -> Self {
        self.setup = commands.iter().map(ToString::to_string).collect();
        self
    }

    fn commands(mut self, commands: &[&str]) -> Self {
        self.commands = commands.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.image.clone(),
            env: self.env.clone(),
        }
    }
}

/// Checks available without a config file
#[must_use]
pub fn builtin_checks() -> Vec<CheckDef> {
    vec![
        CheckDef::builtin(
            "java",
            "Check java, groovy, and sql formatting via spotless.",
            "Check java formatting",
            "amazoncorretto:21-al2023",
        )
        .commands(&["./gradlew spotlessCheck --scan"]),
        CheckDef::builtin(
            "js",
            "Check yaml and json formatting via prettier.",
            "Check js formatting",
            "node:18.18.0-slim",
        )
        .setup(&["npm install -g prettier@3.0.3"])
        .commands(&["prettier --check ."]),
        CheckDef::builtin(
            "license",
            "Check license headers in python and java code via addlicense.",
            "Check license header",
            "golang:1.21",
        )
        .setup(&["go install github.com/google/addlicense@v1.1.1"])
        .commands(&["addlicense -l apache -v -f LICENSE_SHORT --check ."]),
        CheckDef::builtin(
            "python",
            "Check python formatting via black and isort.",
            "Check python formatting",
            "python:3.10.12-slim",
        )
        .setup(&["pip install poetry==1.5.1"])
        .commands(&[
            "poetry install --no-root",
            "poetry run isort --settings-file pyproject.toml --check-only .",
            "poetry run black --config pyproject.toml --check .",
        ]),
    ]
}

/// Overlay `overrides` on `base`: same-named checks are replaced in place, new ones appended.
#[must_use]
pub fn merge_checks(base: Vec<CheckDef>, overrides: Vec<CheckDef>) -> Vec<CheckDef> {
    let mut merged = base;
    for check in overrides {
        match merged.iter_mut().find(|existing| existing.name == check.name) {
            Some(existing) => *existing = check,
            None => merged.push(check),
        }
    }
    merged
}

/// Leaf action running one [`CheckDef`] against the shared client
pub struct FormatCheck {
    def: CheckDef,
}

impl FormatCheck {
    #[must_use]
    pub fn new(def: CheckDef) -> Self {
        Self { def }
    }

    /// The check's container, with the image replaced when `--image` was given
    fn container_spec(&self, matches: &ArgMatches) -> ContainerSpec {
        let mut spec = self.def.container_spec();
        if let Ok(Some(image)) = matches.try_get_one::<String>(IMAGE) {
            spec.image.clone_from(image);
        }
        spec
    }

    async fn run_commands(&self, container: &Container<'_>, setup: bool) -> Outcome {
        let setup_commands: &[String] = if setup { &self.def.setup } else { &[] };
        for cmd in setup_commands.iter().chain(&self.def.commands) {
            match container.exec(cmd).await {
                Ok(result) if result.success => {
                    debug!("'{}' passed `{cmd}`", self.def.name);
                }
                Ok(result) => return Outcome::failure(&self.def.name, describe(cmd, &result)),
                Err(e) => {
                    return Outcome::failure(&self.def.name, format!("`{cmd}` could not run: {e}"));
                }
            }
        }
        Outcome::Success
    }
}

impl LeafAction for FormatCheck {
    fn run<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        matches: &'a ArgMatches,
    ) -> LocalBoxFuture<'a, Result<Outcome, DispatchError>> {
        Box::pin(async move {
            let client = ctx.client(&self.def.pipeline).await?;
            let container = match client
                .container(&self.def.name, &self.container_spec(matches))
                .await
            {
                Ok(container) => container,
                Err(e) => return Ok(Outcome::failure(&self.def.name, e.to_string())),
            };
            let setup = client.engine() != Engine::Local;
            let outcome = self.run_commands(&container, setup).await;
            container.stop().await;
            Ok(outcome)
        })
    }
}

fn describe(cmd: &str, result: &ExecResult) -> String {
    let status = match result.exit_code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    };
    let mut detail = format!("`{cmd}` {status}");
    for output in [&result.stdout, &result.stderr] {
        let output = output.trim_end();
        if !output.is_empty() {
            detail.push('\n');
            detail.push_str(output);
        }
    }
    detail
}

/// The `check` group: runs every check when invoked bare, collecting all failures.
#[must_use]
pub fn check_group(checks: Vec<CheckDef>) -> Group {
    let mut group = Group::new("check", "Run code format checks and fail if any checks fail.")
        .arg(
            Arg::new(LIST_ERRORS)
                .long("list-errors")
                .action(ArgAction::SetTrue)
                .help("Show detailed error messages for failed checks"),
        )
        .arg(
            Arg::new(FAIL_FAST)
                .long("fail-fast")
                .action(ArgAction::SetTrue)
                .help("Stop on first failure"),
        )
        .chained(true)
        .invoke_without_selection(true)
        .errors_hint(
            "Run `formatci check --list-errors` to see detailed error messages for failed checks.",
        );
    for def in checks {
        let (name, about) = (def.name.clone(), def.about.clone());
        group = group.lazy_child(name, about, move || {
            Leaf::new(def.name.clone(), def.about.clone(), FormatCheck::new(def.clone()))
                .arg(image_arg())
                .into()
        });
    }
    group
}

fn image_arg() -> Arg {
    Arg::new(IMAGE)
        .long("image")
        .value_name("IMAGE")
        .help("Run the check in this image instead of its default")
}

/// Root of the `formatci` command tree
#[must_use]
pub fn root_group(checks: Vec<CheckDef>) -> Group {
    Group::new("formatci", "Run containerized code format checks.").lazy_child(
        "check",
        "Run code format checks and fail if any checks fail.",
        move || CommandNode::from(check_group(checks.clone())),
    )
}
