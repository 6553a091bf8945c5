use std::ffi::OsString;

use clap::{Arg, ArgMatches};
use futures::future::LocalBoxFuture;
use log::debug;

use crate::commands::{DispatchError, Outcome};
use crate::context::InvocationContext;

/// The single action performed by a [`Leaf`]
pub trait LeafAction {
    /// Run the action against the merged context.
    ///
    /// Failed checks are reported as `Outcome::Failure`. Errors are reserved for problems
    /// that should abort the whole dispatch, such as a client that cannot be provisioned.
    fn run<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        matches: &'a ArgMatches,
    ) -> LocalBoxFuture<'a, Result<Outcome, DispatchError>>;
}

/// Terminal command performing one action
pub struct Leaf {
    name: String,
    about: String,
    args: Vec<Arg>,
    action: Box<dyn LeafAction>,
}

impl Leaf {
    pub fn new(
        name: impl Into<String>,
        about: impl Into<String>,
        action: impl LeafAction + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            about: about.into(),
            args: Vec::new(),
            action: Box::new(action),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn about(&self) -> &str {
        &self.about
    }

    fn command(&self) -> clap::Command {
        clap::Command::new(self.name.clone())
            .about(self.about.clone())
            .args(self.args.iter().cloned())
    }

    pub(crate) fn execute<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        argv: Vec<OsString>,
    ) -> LocalBoxFuture<'a, Result<Outcome, DispatchError>> {
        Box::pin(async move {
            let matches = self
                .command()
                .try_get_matches_from(std::iter::once(OsString::from(&self.name)).chain(argv))?;
            debug!("Running '{}'", self.name);
            self.action.run(ctx, &matches).await
        })
    }
}
