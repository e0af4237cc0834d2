//! File watching for the dev loop
//!
//! notify delivers events on its own thread; they are forwarded into a tokio
//! channel and batched by [`Debouncer`] until the file system goes quiet.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::FxHashSet;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Watch `root` recursively; the watcher stops when the returned handle is dropped
pub fn watch(root: &Path) -> Result<(RecommendedWatcher, UnboundedReceiver<notify::Event>)> {
    let (tx, rx) = unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => tracing::warn!(error = %err, "watch error"),
        }
    })
    .context("failed to create file watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    tracing::info!(root = %root.display(), "watching for changes");
    Ok((watcher, rx))
}

/// Collects changed paths until no event arrived for `quiet`
pub struct Debouncer {
    quiet: Duration,
    /// Paths under these directories are never reported
    ignored: Vec<PathBuf>,
    changes: FxHashSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration, ignored: Vec<PathBuf>) -> Self {
        Self {
            quiet,
            ignored,
            changes: FxHashSet::default(),
            last_event: None,
        }
    }

    pub fn add_event(&mut self, event: &notify::Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Remove(_) => {}
            // mtime/chmod noise
            EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => {}
            _ => return,
        }

        for path in &event.paths {
            if self.ignored.iter().any(|dir| path.starts_with(dir)) {
                continue;
            }
            tracing::trace!(kind = ?event.kind, path = %path.display(), "file event");
            self.changes.insert(path.clone());
            self.last_event = Some(Instant::now());
        }
    }

    pub fn is_ready(&self) -> bool {
        match self.last_event {
            Some(last) => last.elapsed() >= self.quiet && !self.changes.is_empty(),
            None => false,
        }
    }

    /// Drain the batch once the quiet period has passed, in path order
    pub fn take_if_ready(&mut self) -> Option<Vec<PathBuf>> {
        if !self.is_ready() {
            return None;
        }
        self.last_event = None;
        let mut paths: Vec<_> = self.changes.drain().collect();
        paths.sort();
        Some(paths)
    }

    /// Time left until the current batch could be ready
    pub fn sleep_duration(&self) -> Duration {
        match self.last_event {
            Some(last) => self
                .quiet
                .saturating_sub(last.elapsed())
                .max(Duration::from_millis(1)),
            None => Duration::from_secs(86400),
        }
    }
}
