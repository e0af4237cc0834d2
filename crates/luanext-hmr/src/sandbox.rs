//! Evaluation sandbox
//!
//! Runs chunk code against an explicit, closed environment. Code sees the
//! bindings it is handed plus any globals the host opted in by name, and
//! nothing else of the VM's global table.

use mlua::{Function, Lua, Table, Value};
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Sandbox configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Global names copied from the VM into every environment (empty = none)
    pub permitted_globals: Vec<String>,
}

/// The closed set of values injected into evaluated code
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<(String, Value)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a binding
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }
}

/// Capability to execute a chunk of code
pub trait Evaluator {
    /// Execute `code`, identified by `source_id` in diagnostics
    ///
    /// Errors are surfaced, never swallowed: a failed chunk may have left the
    /// runtime partially initialized.
    fn evaluate(&self, code: &str, source_id: &str, bindings: &Bindings) -> Result<(), SandboxError>;
}

/// [`Evaluator`] backed by an embedded Lua VM
#[derive(Clone)]
pub struct LuaSandbox {
    lua: Lua,
    config: SandboxConfig,
}

impl LuaSandbox {
    pub fn new(lua: Lua, config: SandboxConfig) -> Self {
        Self { lua, config }
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Build a fresh environment table holding only `bindings` and the permitted globals
    fn environment(&self, bindings: &Bindings) -> mlua::Result<Table> {
        let env = self.lua.create_table()?;
        let globals = self.lua.globals();
        for name in &self.config.permitted_globals {
            let value: Value = globals.raw_get(name.as_str())?;
            env.raw_set(name.as_str(), value)?;
        }
        for (name, value) in &bindings.entries {
            env.raw_set(name.as_str(), value.clone())?;
        }
        Ok(env)
    }

    /// Compile a module body into a `function(require, module, exports)` factory
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Evaluation`] if the body does not parse.
    pub fn compile_factory(
        &self,
        body: &str,
        source_id: &str,
        bindings: &Bindings,
    ) -> Result<Function, SandboxError> {
        let env = self.environment(bindings).map_err(SandboxError::Bindings)?;
        let wrapped = wrap_factory(body);
        self.lua
            .load(wrapped.as_str())
            .set_name(chunk_name(source_id))
            .set_environment(env)
            .eval::<Function>()
            .map_err(|source| {
                tracing::error!(source_id, error = %source, "failed to compile module factory");
                SandboxError::Evaluation {
                    source_id: source_id.to_string(),
                    source,
                }
            })
    }
}

impl Evaluator for LuaSandbox {
    fn evaluate(&self, code: &str, source_id: &str, bindings: &Bindings) -> Result<(), SandboxError> {
        let env = self.environment(bindings).map_err(SandboxError::Bindings)?;
        tracing::debug!(source_id, bytes = code.len(), "evaluating chunk");
        self.lua
            .load(code)
            .set_name(chunk_name(source_id))
            .set_environment(env)
            .exec()
            .map_err(|source| {
                tracing::error!(source_id, error = %source, "chunk evaluation failed");
                SandboxError::Evaluation {
                    source_id: source_id.to_string(),
                    source,
                }
            })
    }
}

/// Text of a factory for `body`, the same shape chunk files use
pub fn wrap_factory(body: &str) -> String {
    format!("return function(require, module, exports)\n{body}\nend\n")
}

fn chunk_name(source_id: &str) -> String {
    format!("@{source_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{LuaOptions, StdLib};

    fn sandbox(permitted: &[&str]) -> LuaSandbox {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default()).unwrap();
        LuaSandbox::new(
            lua,
            SandboxConfig {
                permitted_globals: permitted.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    #[test]
    fn test_injected_binding_is_visible() {
        let sandbox = sandbox(&[]);
        let sink = sandbox.lua().create_table().unwrap();
        let bindings = Bindings::new().with("sink", Value::Table(sink.clone()));

        sandbox
            .evaluate("sink.answer = 40 + 2", "answer.lua", &bindings)
            .unwrap();

        let answer: i64 = sink.get("answer").unwrap();
        assert_eq!(answer, 42);
    }

    #[test]
    fn test_host_globals_are_hidden() {
        let sandbox = sandbox(&[]);
        let sink = sandbox.lua().create_table().unwrap();
        let bindings = Bindings::new().with("sink", Value::Table(sink.clone()));

        sandbox
            .evaluate("sink.has_string = string ~= nil", "probe.lua", &bindings)
            .unwrap();

        let has_string: bool = sink.get("has_string").unwrap();
        assert!(!has_string);
    }

    #[test]
    fn test_chunk_globals_do_not_leak_into_host() {
        let sandbox = sandbox(&[]);
        sandbox
            .evaluate("leaked = true", "leak.lua", &Bindings::new())
            .unwrap();

        let leaked: Value = sandbox.lua().globals().get("leaked").unwrap();
        assert!(leaked.is_nil());
    }

    #[test]
    fn test_permitted_global_is_copied_in() {
        let sandbox = sandbox(&["string"]);
        let sink = sandbox.lua().create_table().unwrap();
        let bindings = Bindings::new().with("sink", Value::Table(sink.clone()));

        sandbox
            .evaluate("sink.upper = string.upper('hmr')", "upper.lua", &bindings)
            .unwrap();

        let upper: String = sink.get("upper").unwrap();
        assert_eq!(upper, "HMR");
    }

    #[test]
    fn test_errors_carry_source_id() {
        let sandbox = sandbox(&[]);
        let err = sandbox
            .evaluate("local f = nil\nf()", "broken/chunk.lua", &Bindings::new())
            .unwrap_err();

        match err {
            SandboxError::Evaluation { source_id, source } => {
                assert_eq!(source_id, "broken/chunk.lua");
                assert!(source.to_string().contains("broken/chunk.lua"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_compile_factory_produces_callable() {
        let sandbox = sandbox(&[]);
        let factory = sandbox
            .compile_factory("exports.value = 7", "src/seven.lua", &Bindings::new())
            .unwrap();

        let module = sandbox.lua().create_table().unwrap();
        let exports = sandbox.lua().create_table().unwrap();
        factory
            .call::<()>((Value::Nil, module, exports.clone()))
            .unwrap();

        let value: i64 = exports.get("value").unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_rebinding_replaces_value() {
        let bindings = Bindings::new()
            .with("runtime", Value::Boolean(false))
            .with("runtime", Value::Boolean(true));
        assert_eq!(bindings.entries.len(), 1);
        assert_eq!(bindings.entries[0].1, Value::Boolean(true));
    }
}
