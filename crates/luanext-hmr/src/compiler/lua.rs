//! Reference compiler for plain Lua projects
//!
//! Follows literal `require` calls from each configured entry, rewrites
//! them to module ids and groups modules into chunks: a module reached
//! from a single entry lives in that entry's chunk, a module reached from
//! several lives in the [`SHARED_CHUNK`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::scan::{lua_string, rewrite_requires, scan_requires, RequireCall};
use super::{BuildRequest, CompileOutput, Compiler, OutputChunk, OutputModule};
use crate::config::EntryConfig;
use crate::error::CompileError;
use crate::manifest::Chunk;
use crate::runtime::ModuleId;

/// Chunk holding modules reached from more than one entry
pub const SHARED_CHUNK: &str = "shared";

/// A source file as last read from disk
#[derive(Debug)]
struct CachedSource {
    text: String,
    hash: blake3::Hash,
    requires: Vec<RequireCall>,
}

/// A reachable module with its `require` targets resolved
struct ResolvedModule {
    source: Arc<CachedSource>,
    targets: Vec<Option<ModuleId>>,
}

pub struct LuaProjectCompiler {
    root: PathBuf,
    entries: Vec<EntryConfig>,
    sources: Mutex<FxHashMap<ModuleId, Arc<CachedSource>>>,
}

impl LuaProjectCompiler {
    pub fn new(root: impl Into<PathBuf>, entries: Vec<EntryConfig>) -> Self {
        Self {
            root: root.into(),
            entries,
            sources: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Module id of `path`: relative to the root, `/`-separated
    ///
    /// `None` for paths outside the project root.
    pub fn module_id(&self, path: &Path) -> Option<ModuleId> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        normalize(relative)
    }

    /// Content hash of a cached source
    pub fn source_hash(&self, id: &str) -> Option<blake3::Hash> {
        self.sources.lock().get(id).map(|source| source.hash)
    }

    fn load(
        &self,
        sources: &mut FxHashMap<ModuleId, Arc<CachedSource>>,
        id: &str,
    ) -> Result<Arc<CachedSource>, CompileError> {
        if let Some(source) = sources.get(id) {
            return Ok(Arc::clone(source));
        }

        let path = self.root.join(id);
        let text = std::fs::read_to_string(&path).map_err(|e| CompileError::Read {
            path: path.clone(),
            message: e.to_string(),
        })?;
        tracing::trace!(module = id, bytes = text.len(), "read source");

        let source = Arc::new(CachedSource {
            hash: blake3::hash(text.as_bytes()),
            requires: scan_requires(&text),
            text,
        });
        sources.insert(id.to_string(), Arc::clone(&source));
        Ok(source)
    }

    fn exists(&self, sources: &FxHashMap<ModuleId, Arc<CachedSource>>, id: &str) -> bool {
        sources.contains_key(id) || self.root.join(id).is_file()
    }

    /// Module id for a `require` name, if the project has such a file
    fn resolve(&self, sources: &FxHashMap<ModuleId, Arc<CachedSource>>, name: &str) -> Option<ModuleId> {
        let candidates: Vec<String> = if name.ends_with(".lua") || name.contains('/') {
            vec![name.to_string()]
        } else {
            let base = name.replace('.', "/");
            vec![format!("{base}.lua"), format!("{base}/init.lua")]
        };

        candidates
            .iter()
            .filter_map(|candidate| normalize(Path::new(candidate)))
            .find(|id| self.exists(sources, id))
    }

    fn entry_ids(&self, sources: &FxHashMap<ModuleId, Arc<CachedSource>>) -> Result<Vec<ModuleId>, CompileError> {
        self.entries
            .iter()
            .map(|entry| {
                self.module_id(&entry.path)
                    .filter(|id| self.exists(sources, id))
                    .ok_or_else(|| CompileError::EntryNotFound {
                        name: entry.name.clone(),
                        path: self.root.join(&entry.path),
                    })
            })
            .collect()
    }
}

impl Compiler for LuaProjectCompiler {
    fn compile(&self, request: &BuildRequest) -> Result<CompileOutput, CompileError> {
        let mut sources = self.sources.lock();
        if request.changed.is_empty() {
            sources.clear();
        } else {
            for path in &request.changed {
                if let Some(id) = self.module_id(path) {
                    sources.remove(&id);
                }
            }
        }

        let entry_ids = self.entry_ids(&sources)?;

        // Which entries reach each module
        let mut modules: BTreeMap<ModuleId, ResolvedModule> = BTreeMap::new();
        let mut reached_from: FxHashMap<ModuleId, Vec<usize>> = FxHashMap::default();
        for (index, entry_id) in entry_ids.iter().enumerate() {
            let mut seen = FxHashSet::default();
            let mut queue = vec![entry_id.clone()];
            while let Some(id) = queue.pop() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                reached_from.entry(id.clone()).or_default().push(index);

                if !modules.contains_key(&id) {
                    let source = self.load(&mut sources, &id)?;
                    let targets = source
                        .requires
                        .iter()
                        .map(|call| self.resolve(&sources, &call.name))
                        .collect();
                    modules.insert(id.clone(), ResolvedModule { source, targets });
                }
                queue.extend(modules[&id].targets.iter().flatten().cloned());
            }
        }
        drop(sources);

        let chunk_of = |id: &str| owning_chunk(&self.entries, &entry_ids, &reached_from, id);

        let mut members: FxHashMap<&str, Vec<OutputModule>> = FxHashMap::default();
        let mut imports: FxHashMap<&str, BTreeSet<&str>> = FxHashMap::default();
        for (id, module) in &modules {
            let owner = chunk_of(id);
            for target in module.targets.iter().flatten() {
                let dependency = chunk_of(target);
                if dependency != owner {
                    imports.entry(owner).or_default().insert(dependency);
                }
            }

            let mut targets = module.targets.iter();
            let code = rewrite_requires(&module.source.text, &module.source.requires, |_| {
                targets.next().cloned().flatten()
            });
            members.entry(owner).or_default().push(OutputModule {
                id: id.clone(),
                source_path: self.root.join(id),
                code,
            });
        }

        let mut chunks = Vec::new();
        for (entry, entry_id) in self.entries.iter().zip(&entry_ids) {
            let mut chunk = Chunk::new(&entry.name, format!("{}.lua", entry.name));
            chunk.is_entry = !entry.dynamic;
            chunk.is_dynamic_entry = entry.dynamic;
            let run = (!entry.dynamic).then_some(entry_id.as_str());
            chunks.push(output_chunk(
                chunk,
                members.remove(entry.name.as_str()).unwrap_or_default(),
                imports.remove(entry.name.as_str()).unwrap_or_default(),
                run,
            ));
        }
        if let Some(shared) = members.remove(SHARED_CHUNK) {
            let chunk = Chunk::new(SHARED_CHUNK, format!("{SHARED_CHUNK}.lua"));
            chunks.push(output_chunk(
                chunk,
                shared,
                imports.remove(SHARED_CHUNK).unwrap_or_default(),
                None,
            ));
        }

        tracing::debug!(
            chunks = chunks.len(),
            modules = modules.len(),
            "compiled project"
        );
        Ok(CompileOutput { chunks })
    }
}

/// Name of the chunk that defines `id`
fn owning_chunk<'e>(
    entries: &'e [EntryConfig],
    entry_ids: &[ModuleId],
    reached_from: &FxHashMap<ModuleId, Vec<usize>>,
    id: &str,
) -> &'e str {
    if let Some(index) = entry_ids.iter().position(|entry| entry == id) {
        return &entries[index].name;
    }
    match reached_from.get(id).map(Vec::as_slice) {
        Some([only]) => &entries[*only].name,
        _ => SHARED_CHUNK,
    }
}

fn output_chunk(
    mut chunk: Chunk,
    modules: Vec<OutputModule>,
    imports: BTreeSet<&str>,
    run_entry: Option<&str>,
) -> OutputChunk {
    chunk.modules = modules.iter().map(|module| module.id.clone()).collect();
    chunk.imports = imports.into_iter().map(str::to_string).collect();
    let code = render_chunk(&chunk.name, &modules, run_entry);
    OutputChunk {
        chunk,
        code,
        modules,
    }
}

/// Chunk file text: one `runtime:define` per module, then the entry require
fn render_chunk(name: &str, modules: &[OutputModule], run_entry: Option<&str>) -> String {
    let mut out = format!("-- chunk: {name}\n");
    for module in modules {
        out.push_str(&format!(
            "runtime:define({}, function(require, module, exports)\n",
            lua_string(&module.id)
        ));
        out.push_str(&module.code);
        if !module.code.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("end)\n");
    }
    if let Some(entry) = run_entry {
        out.push_str(&format!("runtime:require({})\n", lua_string(entry)));
    }
    out
}

/// Join normal components with `/`; `None` if the path escapes its base
fn normalize(path: &Path) -> Option<ModuleId> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}
