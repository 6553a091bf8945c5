use std::cell::{Cell, RefCell};
use std::ffi::OsString;
use std::rc::Rc;

use clap::ArgMatches;
use futures::future::LocalBoxFuture;

use formatci::checks::builtin_checks;
use formatci::client::{ClientError, ClientFactory, ClientHandle, Engine};
use formatci::commands::{
    CommandNode, DispatchError, FAIL_FAST, Group, LIST_ERRORS, Leaf, LeafAction, Outcome,
    exit_status,
};
use formatci::config_file::ConfigError;
use formatci::context::InvocationContext;
use formatci::{command_tree, invoke, load_settings};

type Journal = Rc<RefCell<Vec<String>>>;

struct CountingFactory {
    calls: Rc<Cell<usize>>,
    fail: bool,
}

impl ClientFactory for CountingFactory {
    fn create<'a>(&'a self, name: &'a str) -> LocalBoxFuture<'a, Result<ClientHandle, ClientError>> {
        Box::pin(async move {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(ClientError::EngineUnavailable {
                    engine: Engine::Docker,
                    reason: "Cannot connect to the Docker daemon".to_string(),
                });
            }
            Ok(ClientHandle::new(Engine::Local, std::env::temp_dir(), name))
        })
    }
}

/// Leaf that records its execution, requests the client, and fails with `fail` if set
struct Scripted {
    name: String,
    journal: Journal,
    fail: Option<String>,
}

impl LeafAction for Scripted {
    fn run<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        _matches: &'a ArgMatches,
    ) -> LocalBoxFuture<'a, Result<Outcome, DispatchError>> {
        Box::pin(async move {
            self.journal.borrow_mut().push(self.name.clone());
            ctx.client(&format!("Check {}", self.name)).await?;
            Ok(match &self.fail {
                Some(detail) => Outcome::failure(&self.name, detail),
                None => Outcome::Success,
            })
        })
    }
}

fn leaf(journal: &Journal, name: &str, fail: Option<&str>) -> Leaf {
    Leaf::new(
        name,
        format!("Check {name}"),
        Scripted {
            name: name.to_string(),
            journal: journal.clone(),
            fail: fail.map(ToString::to_string),
        },
    )
}

fn group(journal: &Journal, chained: bool, children: &[(&str, Option<&str>)]) -> Group {
    let mut group = Group::new("check", "Run checks")
        .arg(
            clap::Arg::new(LIST_ERRORS)
                .long("list-errors")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new(FAIL_FAST)
                .long("fail-fast")
                .action(clap::ArgAction::SetTrue),
        )
        .chained(chained)
        .invoke_without_selection(true);
    for (name, fail) in children {
        let journal = journal.clone();
        let (name, fail) = (name.to_string(), fail.map(ToString::to_string));
        group = group.lazy_child(name.clone(), format!("Check {name}"), move || {
            leaf(&journal, &name, fail.as_deref()).into()
        });
    }
    group
}

fn root(check: Group) -> CommandNode {
    let check = RefCell::new(Some(check));
    Group::new("formatci", "Run checks")
        .lazy_child("check", "Run checks", move || {
            CommandNode::from(check.borrow_mut().take().expect("check group loaded twice"))
        })
        .into()
}

fn context(fail: bool) -> (InvocationContext, Rc<Cell<usize>>) {
    let calls = Rc::new(Cell::new(0));
    let ctx = InvocationContext::new(CountingFactory {
        calls: calls.clone(),
        fail,
    });
    (ctx, calls)
}

fn argv(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

fn expect_failure(result: Result<Outcome, DispatchError>) -> formatci::commands::Failure {
    match result {
        Ok(Outcome::Failure(failure)) => failure,
        other => panic!("Expected a failure outcome, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_chained_runs_every_child_and_lists_failures_in_order() {
    let journal = Journal::default();
    let mut tree = root(group(
        &journal,
        true,
        &[("a", Some("a broke")), ("b", None), ("c", Some("c broke"))],
    ));
    let (mut ctx, _) = context(false);

    let failure = expect_failure(invoke(&mut tree, &mut ctx, argv(&["check"])).await);

    assert_eq!(*journal.borrow(), ["a", "b", "c"]);
    assert_eq!(failure.failed_children, ["a", "c"]);
    assert!(failure.detail.starts_with("check failed: a, c\n"));
    assert!(!failure.failed_children.contains(&"b".to_string()));
}

#[tokio::test]
async fn test_non_chained_stops_at_first_failure() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, false, &[("a", Some("a broke")), ("b", None)]));
    let (mut ctx, _) = context(false);

    let failure = expect_failure(invoke(&mut tree, &mut ctx, argv(&["check"])).await);

    assert_eq!(*journal.borrow(), ["a"]);
    assert_eq!(failure.failed_children, ["a"]);
}

#[tokio::test]
async fn test_fail_fast_short_circuits_chained_group() {
    let journal = Journal::default();
    let mut tree = root(group(
        &journal,
        true,
        &[("a", Some("a broke")), ("b", None), ("c", Some("c broke"))],
    ));
    let (mut ctx, _) = context(false);

    let failure =
        expect_failure(invoke(&mut tree, &mut ctx, argv(&["check", "--fail-fast"])).await);

    assert_eq!(*journal.borrow(), ["a"]);
    assert_eq!(failure.failed_children, ["a"]);
}

#[tokio::test]
async fn test_bare_group_without_run_all_requires_subcommand() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, true, &[("a", None)]));
    let (mut ctx, calls) = context(false);

    let result = invoke(&mut tree, &mut ctx, Vec::new()).await;

    match &result {
        Err(DispatchError::SubcommandRequired(name)) => assert_eq!(name, "formatci"),
        other => panic!("Expected SubcommandRequired, got: {other:?}"),
    }
    assert!(journal.borrow().is_empty());
    assert_eq!(calls.get(), 0);
    assert_ne!(exit_status(&result), 0);
}

#[tokio::test]
async fn test_selected_child_runs_alone() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, true, &[("a", Some("a broke")), ("b", None)]));
    let (mut ctx, _) = context(false);

    let result = invoke(&mut tree, &mut ctx, argv(&["check", "b"])).await;

    assert_eq!(result.unwrap(), Outcome::Success);
    assert_eq!(*journal.borrow(), ["b"]);
}

#[tokio::test]
async fn test_chained_selection_runs_each_named_child_in_order() {
    let journal = Journal::default();
    let mut tree = root(group(
        &journal,
        true,
        &[("a", Some("a broke")), ("b", None), ("c", None)],
    ));
    let (mut ctx, calls) = context(false);

    let failure = expect_failure(invoke(&mut tree, &mut ctx, argv(&["check", "c", "a"])).await);

    assert_eq!(*journal.borrow(), ["c", "a"]);
    assert_eq!(failure.failed_children, ["a"]);
    assert!(failure.detail.starts_with("check failed: a\n"));
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_chained_selection_honours_fail_fast() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, true, &[("a", Some("a broke")), ("b", None)]));
    let (mut ctx, _) = context(false);

    let failure = expect_failure(
        invoke(&mut tree, &mut ctx, argv(&["check", "--fail-fast", "a", "b"])).await,
    );

    assert_eq!(*journal.borrow(), ["a"]);
    assert_eq!(failure.failed_children, ["a"]);
}

#[tokio::test]
async fn test_nested_group_without_selection_fails_like_a_child() {
    let journal = Journal::default();
    let check = Group::new("check", "Run checks")
        .chained(true)
        .invoke_without_selection(true)
        .child(Group::new("nested", "Nested checks").child(leaf(&journal, "inner", None)))
        .child(leaf(&journal, "after", None));
    let mut tree = root(check);
    let (mut ctx, _) = context(false);

    let failure = expect_failure(invoke(&mut tree, &mut ctx, argv(&["check"])).await);

    assert_eq!(*journal.borrow(), ["after"]);
    assert_eq!(failure.failed_children, ["nested"]);
}

#[tokio::test]
async fn test_selected_child_only_loads_that_child() {
    let journal = Journal::default();
    let mut node = CommandNode::from(group(&journal, true, &[("a", None), ("b", None)]));
    let (mut ctx, _) = context(false);

    let result = node.execute(&mut ctx, argv(&["b"])).await.unwrap();

    assert!(result.is_success());
    let CommandNode::Group(check) = &node else {
        panic!("Expected a group");
    };
    assert!(!check.is_loaded("a"));
    assert!(check.is_loaded("b"));
}

#[tokio::test]
async fn test_unknown_command() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, true, &[("a", None)]));
    let (mut ctx, _) = context(false);

    let result = invoke(&mut tree, &mut ctx, argv(&["check", "rust"])).await;

    match &result {
        Err(DispatchError::UnknownCommand { group, name }) => {
            assert_eq!(group, "check");
            assert_eq!(name, "rust");
        }
        other => panic!("Expected UnknownCommand, got: {other:?}"),
    }
    assert!(journal.borrow().is_empty());
    assert_eq!(exit_status(&result), 2);
}

#[tokio::test]
async fn test_client_is_provisioned_once_for_all_leaves() {
    let journal = Journal::default();
    let mut tree = root(group(
        &journal,
        true,
        &[("a", None), ("b", Some("b broke")), ("c", None), ("d", None)],
    ));
    let (mut ctx, calls) = context(false);

    let _ = invoke(&mut tree, &mut ctx, argv(&["check"])).await;

    assert_eq!(journal.borrow().len(), 4);
    assert_eq!(calls.get(), 1);
    assert!(ctx.has_client());
}

#[tokio::test]
async fn test_provisioning_failure_aborts_group() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, true, &[("a", None), ("b", None)]));
    let (mut ctx, calls) = context(true);

    let result = invoke(&mut tree, &mut ctx, argv(&["check"])).await;

    match &result {
        Err(DispatchError::ClientProvisioning { name, .. }) => assert_eq!(name, "Check a"),
        other => panic!("Expected ClientProvisioning, got: {other:?}"),
    }
    assert_eq!(*journal.borrow(), ["a"]);
    assert_eq!(calls.get(), 1);
    assert_ne!(exit_status(&result), 0);
}

#[tokio::test]
async fn test_exit_status_all_pass_and_single_failure() {
    let journal = Journal::default();
    let mut passing = root(group(&journal, true, &[("a", None), ("b", None)]));
    let (mut ctx, _) = context(false);
    let result = invoke(&mut passing, &mut ctx, argv(&["check"])).await;
    assert_eq!(exit_status(&result), 0);

    let mut failing = root(group(&journal, true, &[("a", None), ("b", Some("b broke"))]));
    let (mut ctx, _) = context(false);
    let result = invoke(&mut failing, &mut ctx, argv(&["check"])).await;
    assert_ne!(exit_status(&result), 0);
}

#[tokio::test]
async fn test_list_errors_includes_each_failure_detail() {
    let journal = Journal::default();
    let mut tree = root(group(
        &journal,
        true,
        &[("a", Some("a: would reformat a.py")), ("b", Some("b: missing header"))],
    ));
    let (mut ctx, _) = context(false);

    let failure =
        expect_failure(invoke(&mut tree, &mut ctx, argv(&["check", "--list-errors"])).await);

    assert!(ctx.flag(LIST_ERRORS));
    assert!(failure.detail.contains("a: would reformat a.py"));
    assert!(failure.detail.contains("b: missing header"));
    assert!(!failure.detail.contains("--list-errors"));
}

#[tokio::test]
async fn test_without_list_errors_only_hint_is_shown() {
    let journal = Journal::default();
    let mut tree = root(group(
        &journal,
        true,
        &[("a", Some("a: would reformat a.py")), ("b", Some("b: missing header"))],
    ));
    let (mut ctx, _) = context(false);

    let failure = expect_failure(invoke(&mut tree, &mut ctx, argv(&["check"])).await);

    assert!(!failure.detail.contains("would reformat"));
    assert!(failure.detail.ends_with(
        "Re-run `check` with --list-errors to see detailed error messages for failed commands."
    ));
}

#[tokio::test]
async fn test_leaf_arguments_are_validated() {
    let journal = Journal::default();
    let mut tree = root(group(&journal, true, &[("a", None)]));
    let (mut ctx, _) = context(false);

    let result = invoke(&mut tree, &mut ctx, argv(&["check", "a", "--bogus"])).await;

    assert!(matches!(result, Err(DispatchError::Usage(_))));
    assert!(journal.borrow().is_empty());
}

#[tokio::test]
async fn test_real_tree_help_does_not_load_checks() {
    let mut tree = command_tree(builtin_checks());
    let (mut ctx, calls) = context(false);

    let result = invoke(&mut tree, &mut ctx, argv(&["check", "--help"])).await;

    match &result {
        Err(DispatchError::Usage(e)) => {
            assert_eq!(e.kind(), clap::error::ErrorKind::DisplayHelp);
            let help = e.to_string();
            assert!(help.contains("python"));
            assert!(help.contains("--list-errors"));
        }
        other => panic!("Expected help output, got: {other:?}"),
    }
    assert_eq!(exit_status(&result), 0);
    assert_eq!(calls.get(), 0);
}

#[tokio::test]
async fn test_check_help_lists_image_override() {
    let mut tree = command_tree(builtin_checks());
    let (mut ctx, calls) = context(false);

    let result = invoke(&mut tree, &mut ctx, argv(&["check", "python", "--help"])).await;

    match &result {
        Err(DispatchError::Usage(e)) => {
            assert_eq!(e.kind(), clap::error::ErrorKind::DisplayHelp);
            assert!(e.to_string().contains("--image"));
        }
        other => panic!("Expected help output, got: {other:?}"),
    }
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_load_settings_missing_explicit_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yaml");
    match load_settings(Some(&path.to_string_lossy())) {
        Err(ConfigError::ConfigNotFound(p)) => assert_eq!(p, path),
        other => panic!("Expected ConfigNotFound, got: {other:?}"),
    }
}

#[test]
fn test_load_settings_merges_checks_and_resolves_workdir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".formatci.yaml");
    std::fs::write(
        &path,
        r#"
engine: local
workdir: src
checks:
  - name: python
    commands: ["ruff format --check ."]
  - name: rust
    image: rust:1.80
    commands: ["cargo fmt --check"]
"#,
    )
    .unwrap();

    let settings = load_settings(Some(&path.to_string_lossy())).unwrap();

    assert_eq!(settings.engine, Engine::Local);
    assert_eq!(settings.workdir, dir.path().join("src"));
    let names: Vec<&str> = settings.checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["java", "js", "license", "python", "rust"]);
    assert_eq!(settings.checks[3].commands, ["ruff format --check ."]);
    assert_eq!(settings.config_path, Some(path));
}
