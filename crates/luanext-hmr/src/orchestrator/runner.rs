//! In-process execution of a target's build output
//!
//! The runner owns a [`ModuleRuntime`] bootstrapped from the chunk files in
//! the target's output directory and applies hot updates to it. Anything
//! the runtime cannot absorb (a dead-end, a failing module) is answered by
//! throwing the runtime away and bootstrapping a fresh one.

use std::path::PathBuf;
use std::rc::Rc;

use mlua::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use super::MANIFEST_FILE_NAME;
use crate::error::{Result, RuntimeError};
use crate::manifest::BuildManifest;
use crate::protocol::HotUpdate;
use crate::runtime::{FsChunkFetcher, ModuleRuntime, PatchOutcome, PatchReport};
use crate::sandbox::SandboxConfig;

/// What applying one update did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerOutcome {
    Patched(PatchReport),
    /// A fresh runtime was bootstrapped from the output directory
    Reloaded,
    /// The update carried nothing to apply
    Ignored,
}

pub struct LocalRunner {
    out_dir: PathBuf,
    config: SandboxConfig,
    /// Chunks evaluated at startup
    entries: Vec<String>,
    runtime: ModuleRuntime,
    boots: usize,
}

impl LocalRunner {
    /// Create and bootstrap a runner over `out_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or an entry chunk fails
    /// to load.
    pub async fn start(
        out_dir: impl Into<PathBuf>,
        config: SandboxConfig,
        entries: Vec<String>,
    ) -> Result<Self> {
        let mut runner = Self {
            out_dir: out_dir.into(),
            runtime: ModuleRuntime::new(config.clone())?,
            config,
            entries,
            boots: 0,
        };
        runner.reload().await?;
        Ok(runner)
    }

    pub fn runtime(&self) -> &ModuleRuntime {
        &self.runtime
    }

    /// Number of times the runtime was bootstrapped
    pub fn boots(&self) -> usize {
        self.boots
    }

    /// Exports of an already instantiated module
    pub fn import(&self, id: &str) -> Result<Value> {
        self.runtime.exports_of(id)
    }

    /// Replace the runtime with a fresh one and evaluate the entry chunks
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or an entry chunk fails
    /// to load. The previous runtime is kept in that case.
    pub async fn reload(&mut self) -> Result<()> {
        let manifest_path = self.out_dir.join(MANIFEST_FILE_NAME);
        let json = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|source| RuntimeError::ChunkFetch {
                file: MANIFEST_FILE_NAME.to_string(),
                source,
            })?;
        let manifest = BuildManifest::from_json(&json)?;

        let runtime = ModuleRuntime::new(self.config.clone())?;
        runtime.set_manifest(manifest);
        runtime.set_chunk_fetcher(Rc::new(FsChunkFetcher::new(&self.out_dir)));
        for entry in &self.entries {
            runtime.ensure_chunk(entry).await?;
        }

        self.runtime = runtime;
        self.boots += 1;
        tracing::info!(out_dir = %self.out_dir.display(), boots = self.boots, "runtime bootstrapped");
        Ok(())
    }

    /// Apply one update, falling back to a reload when a patch cannot be
    /// applied in place
    ///
    /// # Errors
    ///
    /// Returns an error only if a reload fails.
    pub async fn apply(&mut self, update: &HotUpdate) -> Result<RunnerOutcome> {
        match update {
            HotUpdate::Patch(payload) => match self.runtime.apply_update(payload) {
                Ok(PatchOutcome::Applied(report)) => Ok(RunnerOutcome::Patched(report)),
                Ok(PatchOutcome::FullReload { module }) => {
                    tracing::info!(module = %module, "update not accepted; reloading");
                    self.reload().await?;
                    Ok(RunnerOutcome::Reloaded)
                }
                Err(err) => {
                    tracing::error!(error = %err, "patch failed; reloading");
                    self.reload().await?;
                    Ok(RunnerOutcome::Reloaded)
                }
            },
            HotUpdate::FullReload { .. } => {
                self.reload().await?;
                Ok(RunnerOutcome::Reloaded)
            }
            HotUpdate::Error { path, message } => {
                tracing::error!(path = %path, "build error: {message}");
                Ok(RunnerOutcome::Ignored)
            }
        }
    }

    /// Apply updates until the sending side goes away
    pub async fn run(&mut self, mut updates: UnboundedReceiver<HotUpdate>) {
        while let Some(update) = updates.recv().await {
            if let Err(err) = self.apply(&update).await {
                tracing::error!(error = %err, "failed to apply update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PatchPayload;
    use indoc::indoc;
    use mlua::Function;
    use std::collections::BTreeMap;

    const MAIN_CHUNK: &str = indoc! {r#"
        runtime:define("app", function(require, module, exports)
          local counter = require("counter")
          exports.read = function() return counter.value end
          module.hot:accept()
        end)
        runtime:define("counter", function(require, module, exports)
          exports.value = 1
        end)
        runtime:define("standalone", function(require, module, exports)
          exports.ready = true
        end)
        runtime:require("app")
        runtime:require("standalone")
    "#};

    fn write_output(dir: &std::path::Path) {
        std::fs::write(dir.join("main.lua"), MAIN_CHUNK).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE_NAME),
            r#"{"chunks":{"main":{"file":"main.lua","dependencies":[]}}}"#,
        )
        .unwrap();
    }

    fn patch(id: &str, body: &str) -> HotUpdate {
        let mut code = BTreeMap::new();
        code.insert(id.to_string(), body.to_string());
        HotUpdate::Patch(PatchPayload::new(code))
    }

    fn read(runner: &LocalRunner) -> i64 {
        let app = runner.import("app").unwrap();
        let read: Function = app.as_table().unwrap().get("read").unwrap();
        read.call(()).unwrap()
    }

    async fn runner(dir: &tempfile::TempDir) -> LocalRunner {
        write_output(dir.path());
        LocalRunner::start(dir.path(), SandboxConfig::default(), vec!["main".into()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_boot_runs_entry_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir).await;

        assert_eq!(runner.boots(), 1);
        assert_eq!(read(&runner), 1);
    }

    #[tokio::test]
    async fn test_patch_is_applied_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&dir).await;

        let outcome = runner
            .apply(&patch("counter", "exports.value = 2"))
            .await
            .unwrap();

        let RunnerOutcome::Patched(report) = outcome else {
            panic!("expected an in-place patch");
        };
        assert_eq!(report.boundaries, vec!["app".to_string()]);
        assert_eq!(read(&runner), 2);
        assert_eq!(runner.boots(), 1);
    }

    #[tokio::test]
    async fn test_dead_end_reboots_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&dir).await;

        let outcome = runner
            .apply(&patch("standalone", "exports.ready = false"))
            .await
            .unwrap();

        assert_eq!(outcome, RunnerOutcome::Reloaded);
        assert_eq!(runner.boots(), 2);
        let standalone = runner.import("standalone").unwrap();
        let ready: bool = standalone.as_table().unwrap().get("ready").unwrap();
        assert!(ready);
    }

    #[tokio::test]
    async fn test_failing_patch_reboots() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&dir).await;

        let outcome = runner
            .apply(&patch("counter", "error('boom')"))
            .await
            .unwrap();

        assert_eq!(outcome, RunnerOutcome::Reloaded);
        assert_eq!(read(&runner), 1);
    }

    #[tokio::test]
    async fn test_error_message_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&dir).await;

        let outcome = runner
            .apply(&HotUpdate::Error {
                path: "counter".into(),
                message: "unexpected symbol".into(),
            })
            .await
            .unwrap();

        assert_eq!(outcome, RunnerOutcome::Ignored);
        assert_eq!(runner.boots(), 1);
    }

    #[tokio::test]
    async fn test_missing_output_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let result = LocalRunner::start(dir.path(), SandboxConfig::default(), vec!["main".into()]).await;
        assert!(matches!(result, Err(RuntimeError::ChunkFetch { .. })));
    }
}
