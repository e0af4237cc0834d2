//! Rebuild orchestration
//!
//! One [`BuildTarget`] per configured target owns a compiler, the code map
//! of its last good build and at most one in-flight build. File changes go
//! through [`BuildTarget::handle_change`], which rebuilds, diffs against the
//! previous build and delivers either a patch or a full reload.

mod diff;
mod runner;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::compiler::{BuildRequest, CompileOutput, Compiler, LuaProjectCompiler};
use crate::config::{DevConfig, TargetConfig, TargetMode};
use crate::error::BuildError;
use crate::manifest::{build_manifest, BuildManifest};
use crate::protocol::{HotUpdate, PatchPayload, UpdateChannel};
use crate::runtime::ModuleId;

pub use diff::{changed_modules, content_hash, ModuleCodeMap};
pub use runner::{LocalRunner, RunnerOutcome};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Immutable result of one successful build
#[derive(Debug, Clone)]
pub struct BuildSnapshot {
    /// Increases by one per successful build of the target
    pub generation: u64,
    pub manifest: BuildManifest,
    /// Every module's code
    pub code: ModuleCodeMap,
    /// Modules whose code differs from the previous successful build
    pub delta: ModuleCodeMap,
    /// Source file of each module in the output
    pub sources: FxHashMap<PathBuf, ModuleId>,
    pub hash: blake3::Hash,
    pub duration: Duration,
}

impl BuildSnapshot {
    /// Module built from `path`, if any
    pub fn module_for(&self, path: &Path) -> Option<&ModuleId> {
        self.sources.get(path)
    }
}

/// What a change notification led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The path is not part of the current build
    Ignored,
    /// Rebuilt, but no module's code changed
    Unchanged,
    Patched { module_ids: Vec<ModuleId> },
    FullReload,
}

#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub name: String,
    pub mode: TargetMode,
    pub hmr: bool,
    pub out_dir: PathBuf,
    pub dump_updates: bool,
}

type BuildResult = Result<Arc<BuildSnapshot>, BuildError>;

struct TargetInner {
    options: TargetOptions,
    compiler: Arc<dyn Compiler>,
    channel: Arc<dyn UpdateChannel>,
    current: RwLock<Option<Arc<BuildSnapshot>>>,
    /// Result of the build in flight, published once by its task
    in_flight: Mutex<Option<watch::Receiver<Option<BuildResult>>>>,
    /// Changed paths not yet picked up by a build
    pending: Mutex<Vec<PathBuf>>,
    generation: AtomicU64,
    delivered: AtomicU64,
}

/// Orchestrator for one logical build target
#[derive(Clone)]
pub struct BuildTarget {
    inner: Arc<TargetInner>,
}

impl BuildTarget {
    pub fn new(
        options: TargetOptions,
        compiler: Arc<dyn Compiler>,
        channel: Arc<dyn UpdateChannel>,
    ) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                options,
                compiler,
                channel,
                current: RwLock::new(None),
                in_flight: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Target compiled by a [`LuaProjectCompiler`] over the project root
    pub fn from_config(
        config: &DevConfig,
        target: &TargetConfig,
        channel: Arc<dyn UpdateChannel>,
    ) -> Self {
        let compiler = LuaProjectCompiler::new(config.root.clone(), target.entries.clone());
        let options = TargetOptions {
            name: target.name.clone(),
            mode: target.mode,
            hmr: target.hmr,
            out_dir: config.target_out_dir(target),
            dump_updates: config.dump_updates,
        };
        Self::new(options, Arc::new(compiler), channel)
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn mode(&self) -> TargetMode {
        self.inner.options.mode
    }

    pub fn out_dir(&self) -> &Path {
        &self.inner.options.out_dir
    }

    /// Last successful build
    pub fn snapshot(&self) -> Option<Arc<BuildSnapshot>> {
        self.inner.current.read().clone()
    }

    pub fn is_building(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Build, or join the build already in flight
    ///
    /// All callers joined to one build observe the same result. The build
    /// runs on its own task, so it completes even if every caller is dropped.
    ///
    /// # Errors
    ///
    /// Returns the compile or write error of the build, or
    /// [`BuildError::Aborted`] if the build task died without a result.
    pub async fn build(&self) -> BuildResult {
        let mut done = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                // A closed sender means the task panicked; start over
                Some(done) if done.has_changed().is_ok() => done.clone(),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    tokio::spawn(Arc::clone(&self.inner).run_build(tx));
                    rx
                }
            }
        };

        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(BuildError::Aborted(
                "build task ended without a result".to_string(),
            ))
        })
    }

    /// Wait for the build in flight, if any, ignoring its outcome
    async fn settle(&self) {
        if self.is_building() {
            let _ = self.build().await;
        }
    }

    /// Rebuild for a changed file and deliver the result
    ///
    /// Paths outside the current build are ignored. On failure an `error`
    /// message is sent and the previous build stays current.
    ///
    /// # Errors
    ///
    /// Returns the [`BuildError`] of a failed rebuild, after reporting it on
    /// the update channel.
    pub async fn handle_change(&self, path: &Path) -> Result<UpdateOutcome, BuildError> {
        let Some(current) = self.snapshot() else {
            return Ok(UpdateOutcome::Ignored);
        };
        let Some(module) = current.module_for(path).cloned() else {
            tracing::trace!(target_name = self.name(), path = %path.display(), "not part of the build");
            return Ok(UpdateOutcome::Ignored);
        };

        tracing::info!(target_name = self.name(), module = %module, "change detected");
        self.inner.pending.lock().push(path.to_path_buf());
        self.settle().await;

        let snapshot = match self.build().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.deliver(HotUpdate::Error {
                    path: module,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        if !self.inner.options.hmr {
            if self.claim(snapshot.generation) {
                self.deliver(HotUpdate::full_reload(format!("{module} changed")));
            }
            return Ok(UpdateOutcome::FullReload);
        }

        if snapshot.delta.is_empty() {
            return Ok(UpdateOutcome::Unchanged);
        }

        let payload = PatchPayload::new(snapshot.delta.clone());
        let module_ids = payload.module_ids.clone();
        if self.claim(snapshot.generation) {
            let update = HotUpdate::Patch(payload);
            if self.inner.options.dump_updates {
                self.dump(&update, snapshot.generation).await;
            }
            self.deliver(update);
        }
        Ok(UpdateOutcome::Patched { module_ids })
    }

    /// First caller for a generation delivers it; joined callers do not resend
    fn claim(&self, generation: u64) -> bool {
        self.inner.delivered.fetch_max(generation, Ordering::AcqRel) < generation
    }

    fn deliver(&self, update: HotUpdate) {
        if let Err(err) = self.inner.channel.send(update) {
            tracing::warn!(target_name = self.name(), error = %err, "failed to deliver update");
        }
    }

    async fn dump(&self, update: &HotUpdate, generation: u64) {
        let path = self
            .inner
            .options
            .out_dir
            .join(format!("hmr-update-{generation}.json"));
        let written = match serde_json::to_string_pretty(update) {
            Ok(json) => tokio::fs::write(&path, json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), error = %err, "failed to dump update");
        }
    }
}

impl TargetInner {
    async fn run_build(self: Arc<Self>, done: watch::Sender<Option<BuildResult>>) {
        let result = self.build_once().await;

        // Only this task's receiver can be in the slot while it runs
        *self.in_flight.lock() = None;
        done.send_replace(Some(result));
    }

    async fn build_once(&self) -> BuildResult {
        let started = Instant::now();
        let changed = std::mem::take(&mut *self.pending.lock());
        let previous = self.current.read().clone();
        let request = BuildRequest::changed(changed);

        let compiler = Arc::clone(&self.compiler);
        let output = tokio::task::spawn_blocking(move || compiler.compile(&request))
            .await
            .map_err(|e| BuildError::Aborted(e.to_string()))?
            .inspect_err(|err| {
                tracing::error!(target_name = %self.options.name, error = %err, "build failed");
            })?;

        let manifest = build_manifest(output.chunks.iter().map(|chunk| &chunk.chunk));
        self.write_output(&output, &manifest, previous.is_none())
            .await?;

        let code = output.module_code();
        let delta = match &previous {
            Some(previous) => changed_modules(&previous.code, &code),
            None => code.clone(),
        };
        let snapshot = Arc::new(BuildSnapshot {
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            sources: output
                .modules()
                .map(|module| (module.source_path.clone(), module.id.clone()))
                .collect(),
            hash: content_hash(&code),
            manifest,
            code,
            delta,
            duration: started.elapsed(),
        });

        tracing::info!(
            target_name = %self.options.name,
            generation = snapshot.generation,
            modules = snapshot.code.len(),
            changed = snapshot.delta.len(),
            elapsed_ms = snapshot.duration.as_millis() as u64,
            "build finished"
        );
        *self.current.write() = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn write_output(
        &self,
        output: &CompileOutput,
        manifest: &BuildManifest,
        first: bool,
    ) -> Result<(), BuildError> {
        let out_dir = &self.options.out_dir;
        if first {
            match tokio::fs::remove_dir_all(out_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(write_error(out_dir, e)),
            }
        }
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| write_error(out_dir, e))?;

        for chunk in &output.chunks {
            let path = out_dir.join(&chunk.chunk.file_name);
            tokio::fs::write(&path, &chunk.code)
                .await
                .map_err(|e| write_error(&path, e))?;
        }

        let path = out_dir.join(MANIFEST_FILE_NAME);
        let json = manifest
            .to_json()
            .map_err(|e| write_error(&path, std::io::Error::other(e)))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| write_error(&path, e))
    }
}

fn write_error(path: &Path, source: std::io::Error) -> BuildError {
    BuildError::Write {
        path: path.to_path_buf(),
        source: Arc::new(source),
    }
}

/// All targets of one dev session
pub struct DevServer {
    targets: Vec<BuildTarget>,
}

impl DevServer {
    /// In-process targets are ordered first
    pub fn new(mut targets: Vec<BuildTarget>) -> Self {
        targets.sort_by_key(|target| target.mode() != TargetMode::InProcess);
        Self { targets }
    }

    pub fn targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    pub fn target(&self, name: &str) -> Option<&BuildTarget> {
        self.targets.iter().find(|target| target.name() == name)
    }

    /// Build every target in order
    ///
    /// # Errors
    ///
    /// Stops at the first target whose build fails.
    pub async fn build_all(&self) -> Result<Vec<Arc<BuildSnapshot>>, BuildError> {
        let mut snapshots = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            snapshots.push(target.build().await?);
        }
        Ok(snapshots)
    }

    /// Hand a change to every target in order; one target failing does not stop the rest
    pub async fn handle_change(
        &self,
        path: &Path,
    ) -> Vec<(String, Result<UpdateOutcome, BuildError>)> {
        let mut outcomes = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let outcome = target.handle_change(path).await;
            outcomes.push((target.name().to_string(), outcome));
        }
        outcomes
    }
}
