//! Module runtime
//!
//! A per-execution-context cache of module factories and instantiated
//! modules. The reverse-dependency (parent) graph is recorded from observed
//! `require` calls and drives hot-update propagation in [`ModuleRuntime::patch`].
//!
//! Factories are Lua functions of the form
//!
//! ```lua
//! function(require, module, exports)
//!   local util = require("src/util.lua")
//!   exports.render = function() return util.greet() end
//!   module.hot:accept()
//! end
//! ```

pub mod boundary;
pub mod chunk;
mod module;

use std::cell::{OnceCell, RefCell};
use std::rc::{Rc, Weak};

use mlua::{Function, Lua, LuaOptions, StdLib, UserData, UserDataMethods, Value, Variadic};
use rustc_hash::FxHashMap;

use crate::error::{Result, RuntimeError};
use crate::manifest::BuildManifest;
use crate::protocol::PatchPayload;
use crate::sandbox::{Bindings, Evaluator, LuaSandbox, SandboxConfig};

use boundary::{find_boundaries, GraphNode, ModuleGraph, Propagation};
use chunk::ChunkLoads;

pub use chunk::{ChunkFetcher, FetchFuture, FsChunkFetcher};
pub use module::{AcceptCallback, HotHandle, HotState, ModuleRecord};

/// Stable module identifier: a project-relative path with `/` separators
pub type ModuleId = String;

/// Result of applying a patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied(PatchReport),
    /// No safe incremental path; nothing was mutated and the host must reload
    FullReload { module: ModuleId },
}

/// What a successful patch touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Self-accepting modules that absorbed the update
    pub boundaries: Vec<ModuleId>,
    /// Modules re-required, in discovery order
    pub reexecuted: Vec<ModuleId>,
    /// Modules evicted from the cache
    pub invalidated: Vec<ModuleId>,
}

#[derive(Default)]
struct RuntimeState {
    factories: FxHashMap<ModuleId, Function>,
    cache: FxHashMap<ModuleId, ModuleRecord>,
    /// Modules currently being instantiated, innermost last
    stack: Vec<ModuleId>,
    require_external: Option<Function>,
}

impl ModuleGraph for RuntimeState {
    fn node(&self, id: &str) -> Option<GraphNode<'_>> {
        self.cache.get(id).map(|record| GraphNode {
            self_accepts: record.self_accepts(),
            parents: record.parents(),
        })
    }
}

struct RuntimeInner {
    lua: Lua,
    sandbox: LuaSandbox,
    state: RefCell<RuntimeState>,
    require_fn: OnceCell<Function>,
    manifest: RefCell<BuildManifest>,
    fetcher: RefCell<Option<Rc<dyn ChunkFetcher>>>,
    loads: ChunkLoads,
}

/// Pops the execution stack when instantiation ends, including on error
struct StackFrame<'a> {
    state: &'a RefCell<RuntimeState>,
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        self.state.borrow_mut().stack.pop();
    }
}

/// Handle to a module runtime; clones share the same cache
#[derive(Clone)]
pub struct ModuleRuntime {
    inner: Rc<RuntimeInner>,
}

impl ModuleRuntime {
    /// Create a runtime with its own Lua VM
    ///
    /// # Errors
    ///
    /// Returns an error if the VM or the shared `require` function cannot be
    /// created.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())?;
        Self::with_lua(lua, config)
    }

    /// Create a runtime on an existing Lua VM
    ///
    /// # Errors
    ///
    /// Returns an error if the shared `require` function cannot be created.
    pub fn with_lua(lua: Lua, config: SandboxConfig) -> Result<Self> {
        let inner = Rc::new(RuntimeInner {
            sandbox: LuaSandbox::new(lua.clone(), config),
            lua,
            state: RefCell::new(RuntimeState::default()),
            require_fn: OnceCell::new(),
            manifest: RefCell::new(BuildManifest::default()),
            fetcher: RefCell::new(None),
            loads: ChunkLoads::default(),
        });

        let weak = Rc::downgrade(&inner);
        let require_fn = inner.lua.create_function(move |_, id: String| {
            let runtime = upgrade(&weak)?;
            runtime.require(&id).map_err(mlua::Error::external)
        })?;
        // Freshly created cell; cannot already be set
        let _ = inner.require_fn.set(require_fn);

        Ok(Self { inner })
    }

    pub fn lua(&self) -> &Lua {
        &self.inner.lua
    }

    pub fn sandbox(&self) -> &LuaSandbox {
        &self.inner.sandbox
    }

    /// Install the hook consulted for ids this runtime has no factory for
    pub fn set_require_external(&self, hook: Function) {
        self.inner.state.borrow_mut().require_external = Some(hook);
    }

    /// Register (or overwrite) the factory for `id`
    pub fn define(&self, id: impl Into<ModuleId>, factory: Function) {
        let id = id.into();
        tracing::trace!(module = %id, "define");
        self.inner.state.borrow_mut().factories.insert(id, factory);
    }

    pub fn is_defined(&self, id: &str) -> bool {
        self.inner.state.borrow().factories.contains_key(id)
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.inner.state.borrow().cache.contains_key(id)
    }

    /// Parents recorded for an instantiated module
    pub fn parents_of(&self, id: &str) -> Option<Vec<ModuleId>> {
        self.inner
            .state
            .borrow()
            .cache
            .get(id)
            .map(|record| record.parents().to_vec())
    }

    /// Exports of an instantiated module, without instantiating it
    pub fn exports_of(&self, id: &str) -> Result<Value> {
        let state = self.inner.state.borrow();
        let record = state
            .cache
            .get(id)
            .ok_or_else(|| RuntimeError::ModuleNotFound(id.to_string()))?;
        Ok(record.exports()?)
    }

    /// Return the exports of `id`, instantiating it on first use
    ///
    /// A module is instantiated at most once between invalidations. The
    /// module currently executing, if any, is recorded as a parent.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] when neither the registry nor
    /// the external hook knows `id`, and [`RuntimeError::Evaluation`] when its
    /// factory throws.
    pub fn require(&self, id: &str) -> Result<Value> {
        let factory = {
            let mut state = self.inner.state.borrow_mut();
            let parent = state.stack.last().cloned();
            if let Some(record) = state.cache.get_mut(id) {
                if let Some(parent) = parent {
                    record.add_parent(parent);
                }
                return Ok(record.exports()?);
            }
            state.factories.get(id).cloned()
        };

        match factory {
            Some(factory) => self.instantiate(id, factory),
            None => self.require_external(id),
        }
    }

    fn require_external(&self, id: &str) -> Result<Value> {
        let hook = self.inner.state.borrow().require_external.clone();
        let Some(hook) = hook else {
            return Err(RuntimeError::ModuleNotFound(id.to_string()));
        };

        let value: Value = hook.call(id).map_err(|source| RuntimeError::Evaluation {
            module: id.to_string(),
            source,
        })?;
        if value.is_nil() {
            return Err(RuntimeError::ModuleNotFound(id.to_string()));
        }
        tracing::trace!(module = id, "resolved through external hook");
        Ok(value)
    }

    fn instantiate(&self, id: &str, factory: Function) -> Result<Value> {
        let lua = &self.inner.lua;
        let hot = Rc::new(RefCell::new(HotState::default()));
        let exports = lua.create_table()?;
        let module = lua.create_table()?;
        module.raw_set("id", id)?;
        module.raw_set("exports", exports.clone())?;
        module.raw_set("hot", lua.create_userdata(HotHandle::new(id, Rc::clone(&hot)))?)?;

        {
            let mut state = self.inner.state.borrow_mut();
            let parent = state.stack.last().cloned();
            state
                .cache
                .insert(id.to_string(), ModuleRecord::new(module.clone(), parent, hot));
            state.stack.push(id.to_string());
        }

        tracing::debug!(module = id, "instantiating");
        let outcome = {
            let _frame = StackFrame {
                state: &self.inner.state,
            };
            factory.call::<()>((self.require_fn()?, module.clone(), exports))
        };

        if let Err(source) = outcome {
            // A half-populated entry would never be retried
            self.inner.state.borrow_mut().cache.remove(id);
            tracing::error!(module = id, error = %source, "module factory failed");
            return Err(RuntimeError::Evaluation {
                module: id.to_string(),
                source,
            });
        }

        Ok(module.raw_get("exports")?)
    }

    fn require_fn(&self) -> Result<Function> {
        self.inner
            .require_fn
            .get()
            .cloned()
            .ok_or_else(|| mlua::Error::runtime("require function is not installed").into())
    }

    /// Apply new factories, re-executing only what the update reaches
    ///
    /// Returns [`PatchOutcome::FullReload`] without touching the cache when
    /// some changed module cannot reach a self-accepting boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if a re-executed factory or an accept callback throws.
    /// Factories are already swapped at that point.
    pub fn patch<I>(&self, factories: I) -> Result<PatchOutcome>
    where
        I: IntoIterator<Item = (ModuleId, Function)>,
    {
        let factories: Vec<(ModuleId, Function)> = factories.into_iter().collect();

        let (plan, callbacks, retained_parents) = {
            let state = self.inner.state.borrow();
            let changed = factories.iter().map(|(id, _)| id.as_str());
            let plan = match find_boundaries(&*state, changed) {
                Propagation::Contained(plan) => plan,
                Propagation::DeadEnd { module } => {
                    tracing::warn!(module = %module, "update reached a module nobody accepts; full reload required");
                    return Ok(PatchOutcome::FullReload { module });
                }
            };
            let callbacks: Vec<AcceptCallback> = plan
                .boundaries
                .iter()
                .filter_map(|id| state.cache.get(id))
                .flat_map(ModuleRecord::accept_callbacks)
                .collect();
            // Edges from modules outside the plan are not re-observed when
            // the plan re-executes, so carry them over
            let retained_parents: Vec<(ModuleId, Vec<ModuleId>)> = plan
                .invalidated
                .iter()
                .filter_map(|id| {
                    let record = state.cache.get(id)?;
                    let outside: Vec<ModuleId> = record
                        .parents()
                        .iter()
                        .filter(|parent| !plan.invalidated.contains(*parent))
                        .cloned()
                        .collect();
                    Some((id.clone(), outside))
                })
                .collect();
            (plan, callbacks, retained_parents)
        };

        {
            let mut state = self.inner.state.borrow_mut();
            for id in &plan.invalidated {
                state.cache.remove(id);
            }
            state.factories.extend(factories);
        }

        for id in &plan.reexecute {
            self.require(id)?;
        }

        {
            let mut state = self.inner.state.borrow_mut();
            for (id, parents) in retained_parents {
                if let Some(record) = state.cache.get_mut(&id) {
                    for parent in parents {
                        record.add_parent(parent);
                    }
                }
            }
        }

        for accept in callbacks {
            let deps = accept
                .deps
                .iter()
                .map(|dep| self.exports_of(dep))
                .collect::<Result<Variadic<Value>>>()?;
            accept
                .callback
                .call::<()>(deps)
                .map_err(|source| RuntimeError::AcceptCallback {
                    module: accept.deps.first().cloned().unwrap_or_default(),
                    source,
                })?;
        }

        tracing::info!(
            boundaries = plan.boundaries.len(),
            invalidated = plan.invalidated.len(),
            "patch applied"
        );
        Ok(PatchOutcome::Applied(PatchReport {
            boundaries: plan.boundaries.into_iter().collect(),
            reexecuted: plan.reexecute.into_iter().collect(),
            invalidated: plan.invalidated.into_iter().collect(),
        }))
    }

    /// Compile a patch payload through the sandbox and apply it
    ///
    /// # Errors
    ///
    /// Nothing is applied when a module body fails to compile; otherwise
    /// errors are those of [`patch`](Self::patch).
    pub fn apply_update(&self, payload: &PatchPayload) -> Result<PatchOutcome> {
        let bindings = self.bindings()?;
        let mut factories = Vec::with_capacity(payload.module_ids.len());
        for id in &payload.module_ids {
            let Some(body) = payload.code.get(id) else {
                tracing::warn!(module = %id, "patch lists a module without code");
                continue;
            };
            let factory = self.inner.sandbox.compile_factory(body, id, &bindings)?;
            factories.push((id.clone(), factory));
        }
        self.patch(factories)
    }

    /// The closed set of values chunk code is evaluated against
    pub fn bindings(&self) -> Result<Bindings> {
        let handle = self
            .inner
            .lua
            .create_userdata(RuntimeHandle(Rc::downgrade(&self.inner)))?;
        let mut bindings = Bindings::new().with("runtime", Value::UserData(handle));
        if let Some(hook) = self.inner.state.borrow().require_external.clone() {
            bindings.insert("require_external", Value::Function(hook));
        }
        Ok(bindings)
    }

    /// Evaluate chunk code (a sequence of `runtime:define` calls) in the sandbox
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Sandbox`] if the code fails to load or throws.
    pub fn evaluate_chunk(&self, code: &str, source_id: &str) -> Result<()> {
        let bindings = self.bindings()?;
        self.inner.sandbox.evaluate(code, source_id, &bindings)?;
        Ok(())
    }

    pub fn set_manifest(&self, manifest: BuildManifest) {
        *self.inner.manifest.borrow_mut() = manifest;
    }

    pub fn manifest(&self) -> BuildManifest {
        self.inner.manifest.borrow().clone()
    }

    pub fn set_chunk_fetcher(&self, fetcher: Rc<dyn ChunkFetcher>) {
        *self.inner.fetcher.borrow_mut() = Some(fetcher);
    }
}

fn upgrade(weak: &Weak<RuntimeInner>) -> mlua::Result<ModuleRuntime> {
    weak.upgrade()
        .map(|inner| ModuleRuntime { inner })
        .ok_or_else(|| mlua::Error::runtime("module runtime has been dropped"))
}

/// The `runtime` object seen by chunk code
struct RuntimeHandle(Weak<RuntimeInner>);

impl UserData for RuntimeHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("define", |_, this, (id, factory): (String, Function)| {
            upgrade(&this.0)?.define(id, factory);
            Ok(())
        });
        methods.add_method("require", |_, this, id: String| {
            upgrade(&this.0)?.require(&id).map_err(mlua::Error::external)
        });
        methods.add_method("ensure_chunk", |_, this, name: String| {
            upgrade(&this.0)?
                .ensure_chunk_now(&name)
                .map_err(mlua::Error::external)
        });
    }
}
