use std::ffi::OsString;
use std::io::Write;
use std::time::Instant;

use clap::{Arg, ArgMatches, value_parser};
use futures::future::LocalBoxFuture;
use log::{debug, info};

use crate::commands::{CommandNode, DispatchError, Failure, Outcome};
use crate::context::{InvocationContext, options_from_matches};
use crate::report::{self, Style, Tally};

/// Context key that makes groups include every failure's detail in their report
pub const LIST_ERRORS: &str = "list_errors";
/// Context key that stops a run-all dispatch at the first failure, even in chained groups
pub const FAIL_FAST: &str = "fail_fast";

/// Arg id that collects a selected child's argv unparsed
const PASSTHROUGH: &str = "args";

/// Builds a child the first time it is selected
pub type Loader = Box<dyn Fn() -> CommandNode>;

enum ChildSlot {
    Deferred(Loader),
    Loaded(CommandNode),
}

struct Child {
    name: String,
    about: String,
    slot: ChildSlot,
}

impl Child {
    fn is_loaded(&self) -> bool {
        matches!(self.slot, ChildSlot::Loaded(_))
    }

    fn load(&mut self) -> &mut CommandNode {
        if let ChildSlot::Deferred(loader) = &self.slot {
            debug!("Loading command '{}'", self.name);
            self.slot = ChildSlot::Loaded(loader());
        }
        match &mut self.slot {
            ChildSlot::Loaded(node) => node,
            ChildSlot::Deferred(_) => unreachable!("deferred command was loaded above"),
        }
    }
}

/// Command owning named children, dispatching to the selected one or to all of them
pub struct Group {
    name: String,
    about: String,
    args: Vec<Arg>,
    children: Vec<Child>,
    invoke_without_selection: bool,
    chained: bool,
    errors_hint: Option<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, about: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            about: about.into(),
            args: Vec::new(),
            children: Vec::new(),
            invoke_without_selection: false,
            chained: false,
            errors_hint: None,
        }
    }

    /// Declare an option parsed by this group and merged into the context
    #[must_use]
    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Run every child when invoked without a subcommand
    #[must_use]
    pub fn invoke_without_selection(mut self, yes: bool) -> Self {
        self.invoke_without_selection = yes;
        self
    }

    /// Keep running the remaining children after one fails
    #[must_use]
    pub fn chained(mut self, yes: bool) -> Self {
        self.chained = yes;
        self
    }

    /// Line shown under the failed command names when errors are not listed
    #[must_use]
    pub fn errors_hint(mut self, hint: impl Into<String>) -> Self {
        self.errors_hint = Some(hint.into());
        self
    }

    /// Register a child that is only constructed once selected.
    ///
    /// # Panics
    ///
    /// Panics if a child with the same name is already registered.
    #[must_use]
    pub fn lazy_child(
        self,
        name: impl Into<String>,
        about: impl Into<String>,
        loader: impl Fn() -> CommandNode + 'static,
    ) -> Self {
        self.register(name.into(), about.into(), ChildSlot::Deferred(Box::new(loader)))
    }

    /// Register an already constructed child.
    ///
    /// # Panics
    ///
    /// Panics if a child with the same name is already registered.
    #[must_use]
    pub fn child(self, node: impl Into<CommandNode>) -> Self {
        let node = node.into();
        let (name, about) = (node.name().to_string(), node.about().to_string());
        self.register(name, about, ChildSlot::Loaded(node))
    }

    fn register(mut self, name: String, about: String, slot: ChildSlot) -> Self {
        assert!(
            !self.children.iter().any(|child| child.name == name),
            "duplicate command '{name}' in group '{}'",
            self.name
        );
        self.children.push(Child { name, about, slot });
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

    #[must_use]
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    /// Child names in registration order
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|child| child.name.as_str())
    }

    /// Whether the child called `name` has been constructed
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.children
            .iter()
            .any(|child| child.name == name && child.is_loaded())
    }

    /// Look up a child, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::UnknownCommand` if no child is called `name`.
    pub fn resolve(&mut self, name: &str) -> Result<&mut CommandNode, DispatchError> {
        let index = self.position(name)?;
        Ok(self.children[index].load())
    }

    fn position(&self, name: &str) -> Result<usize, DispatchError> {
        self.children
            .iter()
            .position(|child| child.name == name)
            .ok_or_else(|| DispatchError::UnknownCommand {
                group: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Split `first rest...` into one selection per token naming a child.
    /// Tokens in between belong to the selection before them.
    fn split_chain(
        &self,
        first: &str,
        rest: Vec<OsString>,
    ) -> Result<Vec<(usize, Vec<OsString>)>, DispatchError> {
        let mut selections = vec![(self.position(first)?, Vec::new())];
        for arg in rest {
            let index = arg
                .to_str()
                .and_then(|name| self.children.iter().position(|child| child.name == name));
            match index {
                Some(index) => selections.push((index, Vec::new())),
                None => {
                    if let Some((_, argv)) = selections.last_mut() {
                        argv.push(arg);
                    }
                }
            }
        }
        Ok(selections)
    }

    fn command(&self) -> clap::Command {
        let mut command = clap::Command::new(self.name.clone())
            .about(self.about.clone())
            .args(self.args.iter().cloned())
            .allow_external_subcommands(true)
            .disable_help_subcommand(true);
        // Children are listed for help and routing only; each one parses its own argv.
        for child in &self.children {
            command = command.subcommand(
                clap::Command::new(child.name.clone())
                    .about(child.about.clone())
                    .disable_help_flag(true)
                    .arg(
                        Arg::new(PASSTHROUGH)
                            .num_args(0..)
                            .trailing_var_arg(true)
                            .allow_hyphen_values(true)
                            .value_parser(value_parser!(OsString)),
                    ),
            );
        }
        command
    }

    pub(crate) fn execute<'a>(
        &'a mut self,
        ctx: &'a mut InvocationContext,
        argv: Vec<OsString>,
    ) -> LocalBoxFuture<'a, Result<Outcome, DispatchError>> {
        Box::pin(async move {
            let matches = self
                .command()
                .try_get_matches_from(std::iter::once(OsString::from(&self.name)).chain(argv))?;
            ctx.merge(options_from_matches(&self.args, &matches));

            let selected = matches
                .subcommand()
                .map(|(name, sub)| (name.to_string(), passthrough(sub)));
            match selected {
                Some((name, rest)) if self.chained => {
                    match <[_; 1]>::try_from(self.split_chain(&name, rest)?) {
                        Ok([(index, rest)]) => {
                            debug!("'{}' dispatching to '{name}'", self.name);
                            self.children[index].load().execute(ctx, rest).await
                        }
                        Err(selections) => {
                            debug!("'{}' chaining {} commands", self.name, selections.len());
                            self.run_sequence(ctx, selections).await
                        }
                    }
                }
                Some((name, rest)) => {
                    debug!("'{}' dispatching to '{name}'", self.name);
                    self.resolve(&name)?.execute(ctx, rest).await
                }
                None if self.invoke_without_selection => {
                    info!("'{}' running all {} commands", self.name, self.children.len());
                    let selections = (0..self.children.len()).map(|i| (i, Vec::new())).collect();
                    self.run_sequence(ctx, selections).await
                }
                None => Err(DispatchError::SubcommandRequired(self.name.clone())),
            }
        })
    }

    /// Run `selections` (child index and its argv) in order, then aggregate their failures
    async fn run_sequence(
        &mut self,
        ctx: &mut InvocationContext,
        selections: Vec<(usize, Vec<OsString>)>,
    ) -> Result<Outcome, DispatchError> {
        let stop_on_failure = !self.chained || ctx.flag(FAIL_FAST);
        let sty = Style::stderr();
        let total = selections.len();
        let counter_width = total.to_string().len();
        let total_start = Instant::now();
        let mut tally = Tally::default();
        let mut failures: Vec<Failure> = Vec::new();

        for (i, (index, argv)) in selections.into_iter().enumerate() {
            let child = &mut self.children[index];
            let prefix = format!("[{:>counter_width$}/{total}]", i + 1);
            eprint!("{} {} ", sty.bold(&prefix), child.name);
            let _ = std::io::stderr().flush();

            let start = Instant::now();
            let result = child.load().execute(ctx, argv).await;
            let outcome = match result {
                Ok(outcome) => outcome,
                // A nested group left without a selection fails like any other child.
                Err(e @ DispatchError::SubcommandRequired(_)) => {
                    Outcome::failure(&child.name, e.to_string())
                }
                Err(e) => {
                    eprintln!("{}", sty.red("ERROR"));
                    return Err(e);
                }
            };
            let elapsed = sty.dim(&report::format_duration(start.elapsed()));
            match outcome {
                Outcome::Success => {
                    eprintln!("{} {elapsed}", sty.green("PASS"));
                    tally.passed += 1;
                }
                Outcome::Failure(failure) => {
                    eprintln!("{} {elapsed}", sty.red("FAIL"));
                    tally.failed += 1;
                    failures.push(Failure {
                        command: child.name.clone(),
                        ..failure
                    });
                    if stop_on_failure {
                        break;
                    }
                }
            }
        }

        tally.skipped = total - tally.passed - tally.failed;
        eprintln!(
            "{}",
            report::summary_line(sty, tally, total, total_start.elapsed())
        );

        if failures.is_empty() {
            return Ok(Outcome::Success);
        }
        let default_hint;
        let hint = match &self.errors_hint {
            Some(hint) => hint.as_str(),
            None => {
                default_hint = format!(
                    "Re-run `{}` with --list-errors to see detailed error messages for failed commands.",
                    self.name
                );
                default_hint.as_str()
            }
        };
        let refs: Vec<&Failure> = failures.iter().collect();
        Ok(Outcome::Failure(Failure {
            command: self.name.clone(),
            detail: report::failure_report(&self.name, &refs, ctx.flag(LIST_ERRORS), hint),
            failed_children: failures.into_iter().map(|f| f.command).collect(),
        }))
    }
}

/// Argv captured for the selected child. Unknown children capture nothing.
fn passthrough(sub: &ArgMatches) -> Vec<OsString> {
    sub.try_get_many::<OsString>(PASSTHROUGH)
        .ok()
        .flatten()
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}
