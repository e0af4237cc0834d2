//! Build manifest
//!
//! Maps every output chunk to its file and the transitive closure of the
//! chunks it imports, so the runtime can load a chunk's dependencies before
//! any of its modules are required.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::runtime::ModuleId;

/// An immutable build artifact: one output file grouping one or more modules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable chunk name
    pub name: String,

    /// Output file name, relative to the output directory
    pub file_name: String,

    /// Module ids defined by this chunk
    pub modules: Vec<ModuleId>,

    /// Chunks this chunk imports directly
    pub imports: Vec<String>,

    pub is_entry: bool,

    pub is_dynamic_entry: bool,
}

impl Chunk {
    pub fn new(name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            modules: Vec::new(),
            imports: Vec::new(),
            is_entry: false,
            is_dynamic_entry: false,
        }
    }

    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.imports = imports.into_iter().map(Into::into).collect();
        self
    }
}

/// Manifest entry for a single chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub file: String,

    /// Transitive chunk dependencies, each listed after its own dependencies
    pub dependencies: Vec<String>,
}

/// Data integrity problem found while building a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// The chunk reaches itself through its imports
    Cycle { chunk: String },
    /// An import names a chunk that is not part of the build
    UnknownImport { chunk: String, import: String },
    /// Two chunks share a name; the one with the smallest file name is kept
    DuplicateName { chunk: String },
}

/// Chunk name -> file and transitive dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub chunks: BTreeMap<String, ManifestChunk>,

    #[serde(skip)]
    pub issues: Vec<IntegrityIssue>,
}

impl BuildManifest {
    pub fn get(&self, name: &str) -> Option<&ManifestChunk> {
        self.chunks.get(name)
    }

    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Compute the manifest for a set of chunks
///
/// The result does not depend on the order of `chunks`. Cyclic imports
/// terminate and are reported in [`BuildManifest::issues`].
pub fn build_manifest<'a, I>(chunks: I) -> BuildManifest
where
    I: IntoIterator<Item = &'a Chunk>,
{
    let mut issues = Vec::new();
    let mut by_name: FxHashMap<&str, &Chunk> = FxHashMap::default();
    let mut duplicates: BTreeMap<String, Vec<&Chunk>> = BTreeMap::new();

    for chunk in chunks {
        if by_name.contains_key(chunk.name.as_str()) {
            duplicates.entry(chunk.name.clone()).or_default().push(chunk);
        } else {
            by_name.insert(&chunk.name, chunk);
        }
    }

    // Keep the lexicographically smallest definition so duplicates resolve
    // the same way whatever order they arrived in.
    for (name, others) in duplicates {
        let mut candidates = others;
        candidates.push(by_name[name.as_str()]);
        candidates.sort_by(|a, b| (&a.file_name, &a.imports).cmp(&(&b.file_name, &b.imports)));
        by_name.insert(candidates[0].name.as_str(), candidates[0]);
        tracing::warn!(chunk = %name, "duplicate chunk name in build output");
        issues.push(IntegrityIssue::DuplicateName { chunk: name });
    }

    let mut names: Vec<&str> = by_name.keys().copied().collect();
    names.sort_unstable();

    let mut manifest = BuildManifest::default();
    for name in names {
        let chunk = by_name[name];
        let dependencies = collect_dependencies(chunk, &by_name, &mut issues);
        manifest.chunks.insert(
            name.to_string(),
            ManifestChunk {
                file: chunk.file_name.clone(),
                dependencies,
            },
        );
    }

    for issue in &issues {
        if !matches!(issue, IntegrityIssue::DuplicateName { .. }) {
            tracing::warn!(?issue, "chunk graph integrity issue");
        }
    }

    manifest.issues = issues;
    manifest
}

/// Depth-first post-order over the imports of `root`
///
/// Loading the result front to back evaluates every chunk after the chunks
/// it imports. An import chain leading back to `root` is cut and reported.
fn collect_dependencies(
    root: &Chunk,
    by_name: &FxHashMap<&str, &Chunk>,
    issues: &mut Vec<IntegrityIssue>,
) -> Vec<String> {
    let mut entered: FxHashSet<&str> = FxHashSet::default();
    let mut order: Vec<&str> = Vec::new();
    let mut cyclic = false;
    // (name, imports already pushed)
    let mut stack: Vec<(&str, bool)> = root
        .imports
        .iter()
        .rev()
        .map(|name| (name.as_str(), false))
        .collect();

    while let Some((name, expanded)) = stack.pop() {
        if expanded {
            order.push(name);
            continue;
        }
        if name == root.name {
            cyclic = true;
            continue;
        }
        if !entered.insert(name) {
            continue;
        }
        match by_name.get(name) {
            Some(chunk) => {
                stack.push((name, true));
                stack.extend(chunk.imports.iter().rev().map(|i| (i.as_str(), false)));
            }
            None => {
                let issue = IntegrityIssue::UnknownImport {
                    chunk: root.name.clone(),
                    import: name.to_string(),
                };
                if !issues.contains(&issue) {
                    issues.push(issue);
                }
                order.push(name);
            }
        }
    }

    if cyclic {
        issues.push(IntegrityIssue::Cycle {
            chunk: root.name.clone(),
        });
    }

    order.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(name: &str, imports: &[&str]) -> Chunk {
        Chunk::new(name, format!("{name}.lua")).with_imports(imports.iter().copied())
    }

    #[test]
    fn test_entry_with_single_library() {
        let chunks = vec![chunk("entry", &["lib"]), chunk("lib", &[])];
        let manifest = build_manifest(&chunks);

        assert_eq!(manifest.get("entry").unwrap().dependencies, vec!["lib"]);
        assert!(manifest.get("lib").unwrap().dependencies.is_empty());
        assert_eq!(manifest.get("entry").unwrap().file, "entry.lua");
        assert!(manifest.is_consistent());
    }

    #[test]
    fn test_transitive_closure_is_deduplicated() {
        let chunks = vec![
            chunk("app", &["ui", "net"]),
            chunk("ui", &["core"]),
            chunk("net", &["core"]),
            chunk("core", &[]),
        ];
        let manifest = build_manifest(&chunks);

        assert_eq!(
            manifest.get("app").unwrap().dependencies,
            vec!["core", "ui", "net"]
        );
        assert_eq!(manifest.get("ui").unwrap().dependencies, vec!["core"]);
    }

    #[test]
    fn test_dependencies_come_before_their_dependents() {
        // an entry chunk importing another entry chunk that itself needs `shared`
        let chunks = vec![
            chunk("a", &["b"]),
            chunk("b", &["shared"]),
            chunk("shared", &[]),
        ];
        let manifest = build_manifest(&chunks);

        assert_eq!(manifest.get("a").unwrap().dependencies, vec!["shared", "b"]);
        assert_eq!(manifest.get("b").unwrap().dependencies, vec!["shared"]);
    }

    #[test]
    fn test_cycle_terminates_and_is_reported() {
        let chunks = vec![chunk("a", &["b"]), chunk("b", &["a"])];
        let manifest = build_manifest(&chunks);

        assert_eq!(manifest.get("a").unwrap().dependencies, vec!["b"]);
        assert_eq!(manifest.get("b").unwrap().dependencies, vec!["a"]);
        assert!(manifest
            .issues
            .contains(&IntegrityIssue::Cycle { chunk: "a".into() }));
        assert!(manifest
            .issues
            .contains(&IntegrityIssue::Cycle { chunk: "b".into() }));
    }

    #[test]
    fn test_unknown_import_is_reported() {
        let chunks = vec![chunk("a", &["ghost"])];
        let manifest = build_manifest(&chunks);

        assert_eq!(manifest.get("a").unwrap().dependencies, vec!["ghost"]);
        assert_eq!(
            manifest.issues,
            vec![IntegrityIssue::UnknownImport {
                chunk: "a".into(),
                import: "ghost".into()
            }]
        );
    }

    #[test]
    fn test_json_shape() {
        let chunks = vec![chunk("entry", &["lib"]), chunk("lib", &[])];
        let json = build_manifest(&chunks).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["chunks"]["entry"]["file"], "entry.lua");
        assert_eq!(value["chunks"]["entry"]["dependencies"][0], "lib");
        assert!(value.get("issues").is_none());

        let parsed = BuildManifest::from_json(&json).unwrap();
        assert_eq!(parsed.chunks.len(), 2);
    }
}
