//! luanext-dev - hot module replacement dev server for LuaNext projects

mod args;
mod watch;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use args::{Cli, Commands};
use clap::Parser;
use luanext_hmr::{
    BuildError, BuildTarget, DevConfig, DevServer, JsonLinesChannel, LocalRunner, TargetConfig,
    TargetMode, UpdateChannel, UpdateOutcome,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing_subscriber::EnvFilter;
use watch::Debouncer;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = std::fs::canonicalize(&cli.config)
        .with_context(|| format!("config file not found: {}", cli.config.display()))?;
    let mut config = DevConfig::load(&config_path)?;
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("project root not found: {}", config.root.display()))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match cli.command {
        Commands::Build => runtime.block_on(build(&config)),
        Commands::Dev { debounce_ms } => {
            // In-process runners hold a Lua state and stay on this thread
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, dev(&config, Duration::from_millis(debounce_ms)))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// =============================================================================
// Build Command
// =============================================================================

async fn build(config: &DevConfig) -> Result<()> {
    let channel: Arc<dyn UpdateChannel> = Arc::new(JsonLinesChannel::new(std::io::sink()));
    let targets = config
        .targets
        .iter()
        .map(|target| BuildTarget::from_config(config, target, channel.clone()))
        .collect();
    let server = DevServer::new(targets);

    let snapshots = server.build_all().await.context("build failed")?;
    for (target, snapshot) in server.targets().iter().zip(&snapshots) {
        tracing::info!(
            target_name = target.name(),
            chunks = snapshot.manifest.chunks.len(),
            modules = snapshot.code.len(),
            out_dir = %target.out_dir().display(),
            "build complete"
        );
    }
    Ok(())
}

// =============================================================================
// Dev Command
// =============================================================================

async fn dev(config: &DevConfig, debounce: Duration) -> Result<()> {
    // Remote targets share stdout, one JSON message per line
    let stdout: Arc<dyn UpdateChannel> = Arc::new(JsonLinesChannel::new(std::io::stdout()));

    let mut targets = Vec::with_capacity(config.targets.len());
    let mut local = Vec::new();
    for target in &config.targets {
        let channel = match target.mode {
            TargetMode::Remote => stdout.clone(),
            TargetMode::InProcess => {
                let (tx, rx) = unbounded_channel();
                local.push((target, rx));
                Arc::new(tx) as Arc<dyn UpdateChannel>
            }
        };
        targets.push(BuildTarget::from_config(config, target, channel));
    }
    let server = DevServer::new(targets);

    server.build_all().await.context("initial build failed")?;
    for (target, updates) in local {
        start_runner(config, target, updates).await?;
    }

    let (_watcher, mut events) = watch::watch(&config.root)?;
    let mut debouncer = Debouncer::new(debounce, vec![config.out_dir.clone()]);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => debouncer.add_event(&event),
                None => break,
            },
            _ = tokio::time::sleep(debouncer.sleep_duration()) => {
                let Some(paths) = debouncer.take_if_ready() else {
                    continue;
                };
                for path in paths {
                    report(&path, server.handle_change(&path).await);
                }
            }
        }
    }

    tracing::info!("watcher stopped");
    Ok(())
}

/// Boot an in-process target from its first build and feed it updates
async fn start_runner(
    config: &DevConfig,
    target: &TargetConfig,
    updates: UnboundedReceiver<luanext_hmr::HotUpdate>,
) -> Result<()> {
    let entries = target
        .entries
        .iter()
        .filter(|entry| !entry.dynamic)
        .map(|entry| entry.name.clone())
        .collect();

    let mut runner = LocalRunner::start(config.target_out_dir(target), config.sandbox.clone(), entries)
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))
        .with_context(|| format!("failed to start target '{}'", target.name))?;

    tokio::task::spawn_local(async move { runner.run(updates).await });
    Ok(())
}

fn report(path: &Path, outcomes: Vec<(String, Result<UpdateOutcome, BuildError>)>) {
    for (target, outcome) in outcomes {
        match outcome {
            Ok(UpdateOutcome::Ignored) => {
                tracing::debug!(target_name = %target, path = %path.display(), "not part of the build")
            }
            Ok(UpdateOutcome::Unchanged) => {
                tracing::info!(target_name = %target, path = %path.display(), "no module changed")
            }
            Ok(UpdateOutcome::Patched { module_ids }) => tracing::info!(
                target_name = %target,
                path = %path.display(),
                modules = ?module_ids,
                "hot update sent"
            ),
            Ok(UpdateOutcome::FullReload) => {
                tracing::info!(target_name = %target, path = %path.display(), "full reload sent")
            }
            Err(err) => tracing::warn!(target_name = %target, error = %err, "rebuild failed"),
        }
    }
}
