//! On-disk project fixtures
//!
//! A [`ProjectFixture`] is a temporary project root with `src/` files and a
//! `dist/` output directory, plus builders for the config types that point
//! into it.

use std::path::{Path, PathBuf};

use luanext_hmr::{DevConfig, EntryConfig, SandboxConfig, TargetConfig, TargetMode};
use tempfile::TempDir;

pub struct ProjectFixture {
    dir: TempDir,
}

impl ProjectFixture {
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create project dir");
        Self { dir }
    }

    /// Creates a project with `files` written under the root
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let fixture = Self::new();
        for (path, text) in files {
            fixture.write(path, text);
        }
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of `relative` inside the project
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Writes `text` to `relative`, creating parent directories
    pub fn write(&self, relative: &str, text: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create fixture dir");
        }
        std::fs::write(&path, text).expect("failed to write fixture file");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative))
            .unwrap_or_else(|e| panic!("failed to read {relative}: {e}"))
    }

    pub fn remove(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        std::fs::remove_file(&path).expect("failed to remove fixture file");
        path
    }

    /// Config with `targets`, rooted at the project and writing to `dist/`
    pub fn config(&self, targets: Vec<TargetConfig>) -> DevConfig {
        DevConfig {
            root: self.root().to_path_buf(),
            out_dir: self.path("dist"),
            dump_updates: false,
            sandbox: SandboxConfig::default(),
            targets,
        }
    }
}

impl Default for ProjectFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote target with hmr on and one static entry per `(name, path)`
pub fn target(name: &str, entries: &[(&str, &str)]) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        mode: TargetMode::Remote,
        hmr: true,
        entries: entries.iter().map(|(name, path)| entry(name, path)).collect(),
    }
}

pub fn entry(name: &str, path: &str) -> EntryConfig {
    EntryConfig {
        name: name.to_string(),
        path: PathBuf::from(path),
        dynamic: false,
    }
}

pub fn dynamic_entry(name: &str, path: &str) -> EntryConfig {
    EntryConfig {
        dynamic: true,
        ..entry(name, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_parents() {
        let fixture = ProjectFixture::with_files(&[("src/deep/mod.lua", "return 1")]);
        assert_eq!(fixture.read("src/deep/mod.lua"), "return 1");
        assert!(fixture.path("src/deep/mod.lua").starts_with(fixture.root()));
    }

    #[test]
    fn test_config_points_into_project() {
        let fixture = ProjectFixture::new();
        let config = fixture.config(vec![target("client", &[("app", "src/app.lua")])]);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.target_out_dir(&config.targets[0]),
            fixture.path("dist/client")
        );
    }
}
