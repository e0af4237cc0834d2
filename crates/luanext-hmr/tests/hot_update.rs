//! Hot update propagation through a live module runtime

use luanext_hmr::{PatchOutcome, PatchReport};
use luanext_test_helpers::RuntimeHarness;

const A: &str = r#"
local b = require("b")
exports.first = b
exports.read = function() return require("b").value end
"#;

const B: &str = r#"
local c = require("c")
exports.value = "b:" .. c.value
module.hot:accept()
"#;

fn chain() -> RuntimeHarness {
    let harness = RuntimeHarness::with_modules(&[("a", A), ("b", B), ("c", "exports.value = 1")]);
    harness.require("a");
    harness
}

fn report(outcome: PatchOutcome) -> PatchReport {
    match outcome {
        PatchOutcome::Applied(report) => report,
        PatchOutcome::FullReload { module } => panic!("unexpected full reload at {module}"),
    }
}

#[test]
fn test_update_stops_at_self_accepting_parent() {
    let harness = chain();
    let a_before = harness.require("a").to_pointer();
    let old_b = harness.require("b").to_pointer();

    let report = report(harness.patch(&[("c", "exports.value = 2")]));

    assert_eq!(report.boundaries, vec!["b".to_string()]);
    let mut invalidated = report.invalidated.clone();
    invalidated.sort();
    assert_eq!(invalidated, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(report.reexecuted, vec!["c".to_string(), "b".to_string()]);

    // A is not re-run: same exports, still holding the old B
    assert_eq!(harness.require("a").to_pointer(), a_before);
    let first: mlua::Table = harness.get("a", "first");
    assert_eq!(first.to_pointer(), old_b);

    // but anything it requires afresh sees the new B
    let value: String = harness.call("a", "read");
    assert_eq!(value, "b:2");
    assert_ne!(harness.require("b").to_pointer(), old_b);
}

#[test]
fn test_graph_edges_survive_a_patch() {
    let harness = chain();
    harness.patch(&[("c", "exports.value = 2")]);

    let runtime = harness.runtime();
    assert_eq!(runtime.parents_of("b"), Some(vec!["a".to_string()]));
    assert_eq!(runtime.parents_of("c"), Some(vec!["b".to_string()]));

    // and a second patch propagates the same way
    let report = report(harness.patch(&[("c", "exports.value = 3")]));
    assert_eq!(report.boundaries, vec!["b".to_string()]);
    let value: String = harness.call("a", "read");
    assert_eq!(value, "b:3");
}

#[test]
fn test_dead_end_leaves_runtime_untouched() {
    let harness = RuntimeHarness::with_modules(&[
        ("a", "local b = require('b')\nexports.value = b.value"),
        ("b", "exports.value = 1"),
    ]);
    harness.require("a");
    let b_before = harness.require("b").to_pointer();

    let outcome = harness.patch(&[("b", "exports.value = 2")]);

    assert_eq!(
        outcome,
        PatchOutcome::FullReload {
            module: "a".to_string()
        }
    );
    assert_eq!(harness.require("b").to_pointer(), b_before);
    let value: i64 = harness.get("b", "value");
    assert_eq!(value, 1);
}

#[test]
fn test_require_is_a_singleton() {
    let harness = RuntimeHarness::with_modules(&[
        ("shared", "exports.n = 0"),
        ("x", "exports.s = require('shared')"),
        ("y", "exports.s = require('shared')"),
    ]);

    let x: mlua::Table = harness.require("x").get("s").unwrap();
    let y: mlua::Table = harness.require("y").get("s").unwrap();
    assert_eq!(x.to_pointer(), y.to_pointer());
    assert_eq!(harness.require("shared").to_pointer(), x.to_pointer());

    let mut parents = harness.runtime().parents_of("shared").unwrap();
    parents.sort();
    assert_eq!(parents, vec!["x".to_string(), "y".to_string()]);
}

#[test]
fn test_accept_callback_receives_new_exports() {
    const VIEW: &str = r#"
exports.version = VERSION
module.hot:accept(function(new) new.previous = exports.version end)
"#;
    let (v1, v2) = (VIEW.replace("VERSION", "1"), VIEW.replace("VERSION", "2"));
    let harness = RuntimeHarness::with_modules(&[("view", v1.as_str())]);
    harness.require("view");

    let report = report(harness.patch(&[("view", v2.as_str())]));

    assert_eq!(report.boundaries, vec!["view".to_string()]);
    let version: i64 = harness.get("view", "version");
    let previous: i64 = harness.get("view", "previous");
    assert_eq!((version, previous), (2, 1));
}

#[test]
fn test_modules_not_yet_loaded_only_swap_factories() {
    let harness = RuntimeHarness::with_modules(&[("lazy", "exports.v = 1")]);

    let report = report(harness.patch(&[("lazy", "exports.v = 2")]));

    assert!(report.invalidated.is_empty());
    harness.require("lazy");
    let v: i64 = harness.get("lazy", "v");
    assert_eq!(v, 2);
}
