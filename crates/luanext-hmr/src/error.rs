use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::runtime::ModuleId;

/// Errors raised by the module runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No cache entry, no factory, and the external hook did not resolve the id
    #[error("module not found: {0}")]
    ModuleNotFound(ModuleId),

    /// A factory threw while instantiating a module
    #[error("failed to evaluate module '{module}': {source}")]
    Evaluation {
        module: ModuleId,
        #[source]
        source: mlua::Error,
    },

    /// An accept callback threw after its boundary re-executed
    #[error("accept callback of '{module}' failed: {source}")]
    AcceptCallback {
        module: ModuleId,
        #[source]
        source: mlua::Error,
    },

    #[error("chunk '{0}' is not listed in the manifest")]
    ChunkNotFound(String),

    #[error("no chunk fetcher installed; cannot load '{0}'")]
    NoChunkFetcher(String),

    #[error("chunk fetcher cannot load '{0}' synchronously")]
    NoSyncFetch(String),

    #[error("failed to fetch chunk file '{file}': {source}")]
    ChunkFetch {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid build manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Errors raised by the evaluation sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The chunk failed to load or threw while running
    #[error("evaluation of '{source_id}' failed: {source}")]
    Evaluation {
        source_id: String,
        #[source]
        source: mlua::Error,
    },

    /// The environment table could not be assembled
    #[error("failed to prepare sandbox bindings: {0}")]
    Bindings(#[source] mlua::Error),
}

/// Errors reported by a [`Compiler`](crate::compiler::Compiler)
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("entry '{name}' not found at {path}")]
    EntryNotFound { name: String, path: PathBuf },

    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("{0}")]
    Other(String),
}

/// Errors from a build; cloneable so joined callers all observe the same outcome
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("failed to write build output {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("build task aborted: {0}")]
    Aborted(String),
}

/// Errors while delivering a message over an update channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("update channel closed")]
    Closed,

    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write update: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while loading the dev server configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
