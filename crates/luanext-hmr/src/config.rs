//! Dev server configuration (`luanext-dev.yaml`)
//!
//! ```yaml
//! root: .
//! out_dir: dist
//! dump_updates: false
//! sandbox:
//!   permitted_globals: [string, math]
//! targets:
//!   - name: server
//!     mode: in-process
//!     entries:
//!       - { name: main, path: src/main.lua }
//!   - name: client
//!     entries:
//!       - { name: app, path: src/app.lua }
//!       - { name: settings, path: src/settings.lua, dynamic: true }
//! ```

use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::compiler::SHARED_CHUNK;
use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;

pub const DEFAULT_CONFIG_FILE: &str = "luanext-dev.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevConfig {
    /// Project root; entry paths and module ids are relative to it
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Build output; each target writes to `<out_dir>/<target name>`
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Also write every patch payload to disk
    #[serde(default)]
    pub dump_updates: bool,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    pub targets: Vec<TargetConfig>,
}

/// Where a target's code runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMode {
    /// Updates are sent over the update channel
    #[default]
    Remote,
    /// Updates are applied to a runtime inside the dev server
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,

    #[serde(default)]
    pub mode: TargetMode,

    /// Deliver incremental patches; `false` sends a full reload per change
    #[serde(default = "default_hmr")]
    pub hmr: bool,

    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    /// Chunk name of the entry
    pub name: String,

    /// Entry module path, relative to the project root
    pub path: PathBuf,

    /// Loaded on demand instead of at startup
    #[serde(default)]
    pub dynamic: bool,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_hmr() -> bool {
    true
}

impl DevConfig {
    /// Read, resolve and validate a config file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] for an
    /// unreadable file, and [`ConfigError::Invalid`] when validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::parse(&text, path)?.resolved(base);
        config.validate()?;
        tracing::debug!(path = %path.display(), targets = config.targets.len(), "loaded config");
        Ok(config)
    }

    /// Parse YAML without resolving paths; `origin` is used in errors only
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `text` is not a valid config.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Make `root` and `out_dir` absolute against `base`
    pub fn resolved(mut self, base: &Path) -> Self {
        if self.root.is_relative() {
            self.root = base.join(&self.root);
        }
        if self.out_dir.is_relative() {
            self.out_dir = base.join(&self.out_dir);
        }
        self
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a config without targets, a
    /// target without entries, or a duplicate or reserved name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("at least one target is required".into()));
        }

        let mut names = FxHashSet::default();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if target.entries.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' has no entries",
                    target.name
                )));
            }

            let mut entries = FxHashSet::default();
            for entry in &target.entries {
                if entry.name == SHARED_CHUNK {
                    return Err(ConfigError::Invalid(format!(
                        "entry name '{SHARED_CHUNK}' is reserved (target '{}')",
                        target.name
                    )));
                }
                if !entries.insert(entry.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate entry '{}' in target '{}'",
                        entry.name, target.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn target_out_dir(&self, target: &TargetConfig) -> PathBuf {
        self.out_dir.join(&target.name)
    }
}
