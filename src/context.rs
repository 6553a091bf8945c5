//! Shared state for a single command-tree invocation
//!
//! Groups merge their parsed options into the [`InvocationContext`] before dispatching, so
//! descendants see everything their ancestors were given. The context also owns the external
//! client slot, which is filled on first use and then only borrowed.

use clap::{Arg, ArgAction, ArgMatches};
use log::debug;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::client::{ClientFactory, ClientHandle};
use crate::commands::DispatchError;

/// Provisions the external client at most once and hands out borrows of it
pub struct LazyClientProvider {
    factory: Box<dyn ClientFactory>,
    handle: OnceCell<ClientHandle>,
}

impl LazyClientProvider {
    pub fn new(factory: impl ClientFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            handle: OnceCell::new(),
        }
    }

    /// Return the shared client, provisioning it on the first call.
    ///
    /// `provisioning_name` only matters for the call that creates the client.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ClientProvisioning` if the factory fails.
    pub async fn get_or_create(
        &self,
        provisioning_name: &str,
    ) -> Result<&ClientHandle, DispatchError> {
        if self.handle.initialized() {
            debug!("Reusing client for '{provisioning_name}'");
        }
        self.handle
            .get_or_try_init(|| self.factory.create(provisioning_name))
            .await
            .map_err(|source| DispatchError::ClientProvisioning {
                name: provisioning_name.to_string(),
                source,
            })
    }

    #[must_use]
    pub fn get(&self) -> Option<&ClientHandle> {
        self.handle.get()
    }
}

pub struct InvocationContext {
    options: Map<String, Value>,
    client: LazyClientProvider,
}

impl InvocationContext {
    pub fn new(factory: impl ClientFactory + 'static) -> Self {
        Self {
            options: Map::new(),
            client: LazyClientProvider::new(factory),
        }
    }

    /// Copy every option into the context, overwriting keys that are already set.
    pub fn merge(&mut self, options: Map<String, Value>) {
        for (key, value) in options {
            self.options.insert(key, value);
        }
    }

    /// All merged options, in the order they were first set
    #[must_use]
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Boolean option, `false` when unset
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Shared external client. See [`LazyClientProvider::get_or_create`].
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ClientProvisioning` if the client cannot be created.
    pub async fn client(&self, provisioning_name: &str) -> Result<&ClientHandle, DispatchError> {
        self.client.get_or_create(provisioning_name).await
    }

    #[must_use]
    pub fn has_client(&self) -> bool {
        self.client.get().is_some()
    }
}

/// Collect the values of the declared `args` from `matches`, keyed by arg id.
///
/// Args without a value or a default are left out.
#[must_use]
pub fn options_from_matches(args: &[Arg], matches: &ArgMatches) -> Map<String, Value> {
    let mut options = Map::new();
    for arg in args {
        let id = arg.get_id().as_str();
        let value = match arg.get_action() {
            ArgAction::SetTrue | ArgAction::SetFalse => Value::Bool(matches.get_flag(id)),
            ArgAction::Count => Value::from(matches.get_count(id)),
            ArgAction::Help | ArgAction::HelpShort | ArgAction::HelpLong | ArgAction::Version => {
                continue;
            }
            ArgAction::Append => match matches.get_raw(id) {
                Some(raw) => Value::Array(
                    raw.map(|v| Value::String(v.to_string_lossy().into_owned()))
                        .collect(),
                ),
                None => continue,
            },
            _ => match matches.get_raw(id).and_then(|mut raw| raw.next()) {
                Some(v) => Value::String(v.to_string_lossy().into_owned()),
                None => continue,
            },
        };
        options.insert(id.to_string(), value);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, Engine};
    use futures::future::LocalBoxFuture;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingFactory {
        calls: Rc<Cell<usize>>,
        fail: bool,
    }

    impl ClientFactory for CountingFactory {
        fn create<'a>(
            &'a self,
            name: &'a str,
        ) -> LocalBoxFuture<'a, Result<ClientHandle, ClientError>> {
            Box::pin(async move {
                self.calls.set(self.calls.get() + 1);
                if self.fail {
                    return Err(ClientError::EngineUnavailable {
                        engine: Engine::Docker,
                        reason: "no daemon".to_string(),
                    });
                }
                Ok(ClientHandle::new(Engine::Local, std::env::temp_dir(), name))
            })
        }
    }

    fn context(fail: bool) -> (InvocationContext, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let ctx = InvocationContext::new(CountingFactory {
            calls: calls.clone(),
            fail,
        });
        (ctx, calls)
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("Expected object, got: {other}"),
        }
    }

    #[test]
    fn test_merge_overwrites_and_keeps_first_position() {
        let (mut ctx, _) = context(false);
        ctx.merge(as_map(json!({"engine": "docker", "list_errors": false})));
        ctx.merge(as_map(json!({"verbose": 1, "list_errors": true})));

        let keys: Vec<&String> = ctx.options().keys().collect();
        assert_eq!(keys, ["engine", "list_errors", "verbose"]);
        assert!(ctx.flag("list_errors"));
        assert_eq!(ctx.get_str("engine"), Some("docker"));
    }

    #[test]
    fn test_flag_defaults_to_false() {
        let (ctx, _) = context(false);
        assert!(!ctx.flag("list_errors"));
    }

    #[test]
    fn test_options_from_matches_converts_by_action() {
        let args = vec![
            Arg::new("list_errors")
                .long("list-errors")
                .action(ArgAction::SetTrue),
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count),
            Arg::new("exclude")
                .long("exclude")
                .action(ArgAction::Append),
            Arg::new("image").long("image"),
            Arg::new("missing").long("missing"),
        ];
        let matches = clap::Command::new("check")
            .args(args.clone())
            .try_get_matches_from([
                "check",
                "--list-errors",
                "-vv",
                "--exclude",
                "a",
                "--exclude",
                "b",
                "--image",
                "node:18",
            ])
            .unwrap();

        let options = options_from_matches(&args, &matches);
        assert_eq!(
            Value::Object(options),
            json!({
                "list_errors": true,
                "verbose": 2,
                "exclude": ["a", "b"],
                "image": "node:18",
            })
        );
    }

    #[tokio::test]
    async fn test_client_is_created_once() {
        let (ctx, calls) = context(false);
        assert!(!ctx.has_client());

        let first = ctx.client("Check java formatting").await.unwrap();
        let first_session = first.session();
        let second = ctx.client("Check js formatting").await.unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(second.session(), first_session);
        assert_eq!(second.pipeline(), "Check java formatting");
        assert!(ctx.has_client());
    }

    #[tokio::test]
    async fn test_client_provisioning_error() {
        let (ctx, calls) = context(true);
        match ctx.client("Check java formatting").await {
            Err(DispatchError::ClientProvisioning { name, .. }) => {
                assert_eq!(name, "Check java formatting");
            }
            Err(other) => panic!("Expected ClientProvisioning, got: {other:?}"),
            Ok(client) => panic!("Expected an error, got client {client:?}"),
        }
        assert_eq!(calls.get(), 1);
        assert!(!ctx.has_client());
    }
}
