//! Command tree with lazily loaded children
//!
//! A tree is made of [`Group`]s, which own named children and dispatch to one or all of them,
//! and [`Leaf`]s, which perform a single action. Every node executes through
//! [`CommandNode::execute`] with the shared [`InvocationContext`] and the argv that is left
//! for it once its ancestors have parsed their own options.

pub mod group;
pub mod leaf;

use std::ffi::OsString;

use futures::future::LocalBoxFuture;
use thiserror::Error;

use crate::client::ClientError;
use crate::context::InvocationContext;

pub use group::{FAIL_FAST, Group, LIST_ERRORS};
pub use leaf::{Leaf, LeafAction};

/// Errors that abort dispatch instead of being recorded as a failed check
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No such command '{name}' in '{group}'")]
    UnknownCommand { group: String, name: String },
    #[error("Unable to provision client for '{name}': {source}")]
    ClientProvisioning {
        name: String,
        #[source]
        source: ClientError,
    },
    #[error("'{0}' requires a subcommand")]
    SubcommandRequired(String),
    #[error(transparent)]
    Usage(#[from] clap::Error),
}

impl DispatchError {
    /// Process exit status for this error
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            DispatchError::UnknownCommand { .. } | DispatchError::SubcommandRequired(_) => 2,
            DispatchError::ClientProvisioning { .. } => 1,
            DispatchError::Usage(e) => u8::try_from(e.exit_code()).unwrap_or(2),
        }
    }
}

/// A failed command and what went wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub command: String,
    pub detail: String,
    /// Names of the failed children, in execution order. Empty for leaves.
    pub failed_children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(Failure),
}

impl Outcome {
    pub fn failure(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Outcome::Failure(Failure {
            command: command.into(),
            detail: detail.into(),
            failed_children: Vec::new(),
        })
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

pub enum CommandNode {
    Group(Group),
    Leaf(Leaf),
}

impl CommandNode {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            CommandNode::Group(group) => group.name(),
            CommandNode::Leaf(leaf) => leaf.name(),
        }
    }

    #[must_use]
    pub fn about(&self) -> &str {
        match self {
            CommandNode::Group(group) => group.about(),
            CommandNode::Leaf(leaf) => leaf.about(),
        }
    }

    /// Parse `argv` (without the command's own name) and run this node.
    pub fn execute<'a>(
        &'a mut self,
        ctx: &'a mut InvocationContext,
        argv: Vec<OsString>,
    ) -> LocalBoxFuture<'a, Result<Outcome, DispatchError>> {
        match self {
            CommandNode::Group(group) => group.execute(ctx, argv),
            CommandNode::Leaf(leaf) => leaf.execute(ctx, argv),
        }
    }
}

impl From<Group> for CommandNode {
    fn from(group: Group) -> Self {
        CommandNode::Group(group)
    }
}

impl From<Leaf> for CommandNode {
    fn from(leaf: Leaf) -> Self {
        CommandNode::Leaf(leaf)
    }
}

/// Exit status for the result of a root invocation
#[must_use]
pub fn exit_status(result: &Result<Outcome, DispatchError>) -> u8 {
    match result {
        Ok(Outcome::Success) => 0,
        Ok(Outcome::Failure(_)) => 1,
        Err(e) => e.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(exit_status(&Ok(Outcome::Success)), 0);
        assert_eq!(exit_status(&Ok(Outcome::failure("java", "boom"))), 1);
        assert_eq!(
            exit_status(&Err(DispatchError::SubcommandRequired("check".to_string()))),
            2
        );
        assert_eq!(
            exit_status(&Err(DispatchError::UnknownCommand {
                group: "check".to_string(),
                name: "rust".to_string(),
            })),
            2
        );
    }
}
