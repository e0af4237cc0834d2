//! Module runtime helpers for testing hot updates
//!
//! Modules are given as `(id, body)` pairs, where `body` is the inside of a
//! `function(require, module, exports)` factory.

use std::collections::BTreeMap;

use luanext_hmr::compiler::scan::lua_string;
use luanext_hmr::{ModuleRuntime, PatchOutcome, PatchPayload, SandboxConfig};
use mlua::{FromLua, Function, Table};

/// A [`ModuleRuntime`] with shorthand for defining, reading and patching modules
pub struct RuntimeHarness {
    runtime: ModuleRuntime,
}

impl RuntimeHarness {
    /// Creates a runtime with the default sandbox
    ///
    /// # Panics
    ///
    /// Panics if the Lua state cannot be created
    pub fn new() -> Self {
        Self::with_config(SandboxConfig::default())
    }

    pub fn with_config(config: SandboxConfig) -> Self {
        let runtime = ModuleRuntime::new(config).expect("failed to create module runtime");
        Self { runtime }
    }

    /// Creates a runtime with `modules` defined but not yet required
    pub fn with_modules(modules: &[(&str, &str)]) -> Self {
        let harness = Self::new();
        harness.define(modules);
        harness
    }

    pub fn runtime(&self) -> &ModuleRuntime {
        &self.runtime
    }

    /// Defines modules by evaluating them as one chunk
    ///
    /// # Panics
    ///
    /// Panics if the chunk fails to evaluate
    pub fn define(&self, modules: &[(&str, &str)]) {
        let chunk = define_chunk(modules);
        self.runtime
            .evaluate_chunk(&chunk, "harness")
            .unwrap_or_else(|e| panic!("failed to define modules: {e}\n{chunk}"));
    }

    /// Requires `id` and returns its exports table
    pub fn require(&self, id: &str) -> Table {
        let exports = self
            .runtime
            .require(id)
            .unwrap_or_else(|e| panic!("require('{id}') failed: {e}"));
        Table::from_lua(exports, self.runtime.lua())
            .unwrap_or_else(|e| panic!("exports of '{id}' are not a table: {e}"))
    }

    /// Reads `field` from the exports of an instantiated module
    pub fn get<T: FromLua>(&self, id: &str, field: &str) -> T {
        let exports = self
            .runtime
            .exports_of(id)
            .unwrap_or_else(|e| panic!("'{id}' is not instantiated: {e}"));
        let table = Table::from_lua(exports, self.runtime.lua())
            .unwrap_or_else(|e| panic!("exports of '{id}' are not a table: {e}"));
        table
            .get(field)
            .unwrap_or_else(|e| panic!("failed to read {id}.{field}: {e}"))
    }

    /// Calls the exported function `id.name` with no arguments
    pub fn call<T: FromLua>(&self, id: &str, name: &str) -> T {
        let function: Function = self.get(id, name);
        function
            .call(())
            .unwrap_or_else(|e| panic!("{id}.{name}() failed: {e}"))
    }

    /// Applies new bodies for `modules` the way a patch message would
    ///
    /// # Panics
    ///
    /// Panics if the patch fails to compile or a module throws
    pub fn patch(&self, modules: &[(&str, &str)]) -> PatchOutcome {
        self.runtime
            .apply_update(&payload(modules))
            .unwrap_or_else(|e| panic!("patch failed: {e}"))
    }
}

impl Default for RuntimeHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk text defining each module, in the shape the compiler emits
pub fn define_chunk(modules: &[(&str, &str)]) -> String {
    let mut chunk = String::new();
    for (id, body) in modules {
        chunk.push_str(&format!(
            "runtime:define({}, function(require, module, exports)\n{body}\nend)\n",
            lua_string(id)
        ));
    }
    chunk
}

/// Patch payload carrying `modules`
pub fn payload(modules: &[(&str, &str)]) -> PatchPayload {
    let code: BTreeMap<_, _> = modules
        .iter()
        .map(|(id, body)| (id.to_string(), body.to_string()))
        .collect();
    PatchPayload::new(code)
}
