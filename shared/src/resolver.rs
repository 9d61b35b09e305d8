//! Name resolution: the external collaborator that turns a
//! `(module_name, symbol_name)` pair into an invocable function.
//!
//! Resolving names by dynamic import/`eval` at call time is both unsafe and
//! un-idiomatic in Rust. Instead, each worker/broker/controller installs its
//! callables into a [`StaticRegistry`] once at startup, and resolution
//! becomes a hash-map lookup. The wire shape (`module_name`, `symbol_name`
//! strings on the task descriptor) is unchanged so the controller API is
//! unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DistwqError, Result};
use crate::protocol::{KwArgs, Value};

/// A registered callable: positional args plus keyword args in, a value or
/// failure out. Failures become `DistwqError::UserFailure` at the call
/// site; there is no separate per-task error channel back to the
/// controller.
pub type Invocable = Arc<dyn Fn(Vec<Value>, KwArgs) -> anyhow::Result<Value> + Send + Sync>;

/// Resolves `(module_name, symbol_name)` to an [`Invocable`].
pub trait NameResolver: Send + Sync {
    fn resolve(&self, module_name: &str, symbol_name: &str) -> Result<Invocable>;
}

/// A resolver backed by a plain hash map, populated by the binary's `main`
/// before the controller/worker/broker is constructed.
#[derive(Default, Clone)]
pub struct StaticRegistry {
    callables: HashMap<(String, String), Invocable>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        StaticRegistry::default()
    }

    /// Register a callable under `(module_name, symbol_name)`.
    pub fn register(
        &mut self,
        module_name: impl Into<String>,
        symbol_name: impl Into<String>,
        f: impl Fn(Vec<Value>, KwArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        self.callables
            .insert((module_name.into(), symbol_name.into()), Arc::new(f));
    }
}

impl NameResolver for StaticRegistry {
    fn resolve(&self, module_name: &str, symbol_name: &str) -> Result<Invocable> {
        self.callables
            .get(&(module_name.to_string(), symbol_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                DistwqError::UserFailure(format!(
                    "no callable registered for {module_name}::{symbol_name}"
                ))
            })
    }
}
