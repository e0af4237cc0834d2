//! Hot module replacement core for the LuaNext dev server
//!
//! The build side ([`orchestrator`], [`compiler`], [`manifest`]) turns file
//! changes into patches; the execution side ([`runtime`], [`sandbox`])
//! applies them to running code. The two meet only in the wire types of
//! [`protocol`] and the serialized [`manifest::BuildManifest`].

pub mod compiler;
pub mod config;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod protocol;
pub mod runtime;
pub mod sandbox;

// Re-export the types most callers need
pub use config::{DevConfig, EntryConfig, TargetConfig, TargetMode};
pub use error::{
    BuildError, ChannelError, CompileError, ConfigError, RuntimeError, SandboxError,
};
pub use manifest::{build_manifest, BuildManifest, Chunk, IntegrityIssue, ManifestChunk};
pub use orchestrator::{
    BuildSnapshot, BuildTarget, DevServer, LocalRunner, RunnerOutcome, TargetOptions,
    UpdateOutcome,
};
pub use protocol::{HotUpdate, JsonLinesChannel, PatchPayload, UpdateChannel};
pub use runtime::{ModuleId, ModuleRuntime, PatchOutcome, PatchReport};
pub use sandbox::{Bindings, Evaluator, LuaSandbox, SandboxConfig};
