//! Compiler interface used by the rebuild orchestrator
//!
//! The orchestrator treats compilation as a black box: given the paths that
//! changed, produce every output chunk with the code of each member module.

mod lua;
pub mod scan;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::CompileError;
use crate::manifest::Chunk;
use crate::runtime::ModuleId;

pub use lua::{LuaProjectCompiler, SHARED_CHUNK};

/// Inputs of one compilation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    /// Paths that changed since the previous compilation; empty means all
    pub changed: Vec<PathBuf>,
}

impl BuildRequest {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn changed(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            changed: paths.into_iter().collect(),
        }
    }
}

/// A compiled module: its id, where it came from and its factory body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputModule {
    pub id: ModuleId,
    pub source_path: PathBuf,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub chunk: Chunk,
    /// Complete file contents
    pub code: String,
    pub modules: Vec<OutputModule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutput {
    pub chunks: Vec<OutputChunk>,
}

impl CompileOutput {
    /// Every module's code, keyed by id
    pub fn module_code(&self) -> BTreeMap<ModuleId, String> {
        self.modules()
            .map(|module| (module.id.clone(), module.code.clone()))
            .collect()
    }

    pub fn modules(&self) -> impl Iterator<Item = &OutputModule> {
        self.chunks.iter().flat_map(|chunk| chunk.modules.iter())
    }
}

/// Turns project sources into output chunks
pub trait Compiler: Send + Sync {
    fn compile(&self, request: &BuildRequest) -> Result<CompileOutput, CompileError>;
}
