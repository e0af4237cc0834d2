use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Function, Table, UserData, UserDataMethods, Value};

use super::ModuleId;

/// An update-acceptance registration: call `callback` with the exports of `deps`
#[derive(Debug, Clone)]
pub struct AcceptCallback {
    pub deps: Vec<ModuleId>,
    pub callback: Function,
}

/// Hot-update state of one instantiated module
#[derive(Debug, Clone, Default)]
pub struct HotState {
    pub self_accepts: bool,
    pub callbacks: Vec<AcceptCallback>,
}

/// Handle exposed to module code as `module.hot`
///
/// Shares its state with the owning [`ModuleRecord`], so registrations made
/// while the factory runs are visible to the boundary search.
pub struct HotHandle {
    id: ModuleId,
    state: Rc<RefCell<HotState>>,
}

impl HotHandle {
    pub(crate) fn new(id: &str, state: Rc<RefCell<HotState>>) -> Self {
        Self {
            id: id.to_string(),
            state,
        }
    }

    /// Mark the module as an update boundary, optionally registering a callback
    pub fn accept(&self, callback: Option<Function>) {
        let mut state = self.state.borrow_mut();
        state.self_accepts = true;
        if let Some(callback) = callback {
            state.callbacks.push(AcceptCallback {
                deps: vec![self.id.clone()],
                callback,
            });
        }
    }
}

impl UserData for HotHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("accept", |_, this, callback: Option<Function>| {
            this.accept(callback);
            Ok(())
        });
    }
}

/// Live cache entry for an instantiated module
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// The `{ id, exports, hot }` table handed to the factory
    module: Table,
    /// Modules that required this one while executing
    parents: Vec<ModuleId>,
    hot: Rc<RefCell<HotState>>,
}

impl ModuleRecord {
    pub(crate) fn new(module: Table, parent: Option<ModuleId>, hot: Rc<RefCell<HotState>>) -> Self {
        Self {
            module,
            parents: parent.into_iter().collect(),
            hot,
        }
    }

    /// Current value of `module.exports`
    pub fn exports(&self) -> mlua::Result<Value> {
        self.module.raw_get("exports")
    }

    pub fn parents(&self) -> &[ModuleId] {
        &self.parents
    }

    pub(crate) fn add_parent(&mut self, parent: ModuleId) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    pub fn self_accepts(&self) -> bool {
        self.hot.borrow().self_accepts
    }

    pub fn accept_callbacks(&self) -> Vec<AcceptCallback> {
        self.hot.borrow().callbacks.clone()
    }
}
