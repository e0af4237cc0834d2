//! Update propagation over the runtime-observed parent graph
//!
//! Starting from each changed module, climb the parent edges until every
//! path reaches a self-accepting module. A path that runs out of parents
//! first means the change cannot be contained.

use indexmap::IndexSet;
use rustc_hash::FxHashSet;

use super::ModuleId;

/// Read-only view of one cached module, as seen by the boundary search
#[derive(Debug, Clone, Copy)]
pub struct GraphNode<'a> {
    pub self_accepts: bool,
    pub parents: &'a [ModuleId],
}

/// Read-only view of the module cache
pub trait ModuleGraph {
    /// `None` when the module is not instantiated
    fn node(&self, id: &str) -> Option<GraphNode<'_>>;
}

/// Modules to evict and re-execute for one patch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationPlan {
    /// Self-accepting modules that absorb the update
    pub boundaries: IndexSet<ModuleId>,
    /// Every module to re-require, in discovery order
    pub reexecute: IndexSet<ModuleId>,
    /// Every module to evict from the cache
    pub invalidated: IndexSet<ModuleId>,
}

/// Outcome of the boundary search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    Contained(PropagationPlan),
    /// `module` has no parents and does not accept itself
    DeadEnd { module: ModuleId },
}

/// Search boundaries for every changed module
///
/// Visitation order among independent branches is unspecified.
pub fn find_boundaries<G, I, S>(graph: &G, changed: I) -> Propagation
where
    G: ModuleGraph + ?Sized,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut plan = PropagationPlan::default();

    for id in changed {
        if let Err(module) = climb(graph, id.as_ref(), &mut plan) {
            return Propagation::DeadEnd { module };
        }
    }

    Propagation::Contained(plan)
}

fn climb<G>(graph: &G, changed: &str, plan: &mut PropagationPlan) -> Result<(), ModuleId>
where
    G: ModuleGraph + ?Sized,
{
    let mut queue: Vec<(ModuleId, Vec<ModuleId>)> =
        vec![(changed.to_string(), vec![changed.to_string()])];
    let mut visited: FxHashSet<ModuleId> = FxHashSet::default();

    while let Some((id, chain)) = queue.pop() {
        if visited.contains(&id) {
            continue;
        }

        // Nothing loaded references a module that was never instantiated
        let Some(node) = graph.node(&id) else {
            continue;
        };

        if node.self_accepts {
            plan.boundaries.insert(id.clone());
            plan.reexecute.insert(id);
            plan.invalidated.extend(chain);
            continue;
        }

        plan.reexecute.insert(id.clone());
        plan.invalidated.insert(id.clone());
        if node.parents.is_empty() {
            return Err(id);
        }

        for parent in node.parents {
            let mut next = chain.clone();
            next.push(parent.clone());
            queue.push((parent.clone(), next));
        }

        visited.insert(id);
    }

    Ok(())
}
