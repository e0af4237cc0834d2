//! On-demand chunk loading
//!
//! A chunk is fetched and evaluated at most once per runtime. Concurrent
//! requests for the same chunk share one in-flight load; a load that fails
//! is not remembered, so the next request tries again.
//!
//! Module code loads chunks through `runtime:ensure_chunk(name)`, which
//! runs to completion before returning and so needs a fetcher that can
//! read without suspending.

use std::cell::RefCell;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;

use super::ModuleRuntime;
use crate::error::{Result, RuntimeError};

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + 'a>>;

/// Retrieves the code of a chunk file named in the manifest
pub trait ChunkFetcher {
    fn fetch<'a>(&'a self, file: &'a str) -> FetchFuture<'a>;

    /// Read without suspending; `None` when the fetcher cannot
    fn fetch_now(&self, _file: &str) -> Option<Result<String>> {
        None
    }
}

/// Reads chunk files from a build output directory
#[derive(Debug, Clone)]
pub struct FsChunkFetcher {
    out_dir: PathBuf,
}

impl FsChunkFetcher {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl ChunkFetcher for FsChunkFetcher {
    fn fetch<'a>(&'a self, file: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = self.out_dir.join(file);
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| RuntimeError::ChunkFetch {
                    file: file.to_string(),
                    source,
                })
        })
    }

    fn fetch_now(&self, file: &str) -> Option<Result<String>> {
        let path = self.out_dir.join(file);
        Some(
            std::fs::read_to_string(&path).map_err(|source| RuntimeError::ChunkFetch {
                file: file.to_string(),
                source,
            }),
        )
    }
}

/// One load slot per chunk name
#[derive(Default)]
pub(super) struct ChunkLoads {
    cells: RefCell<FxHashMap<String, Rc<OnceCell<()>>>>,
}

impl ChunkLoads {
    fn cell(&self, name: &str) -> Rc<OnceCell<()>> {
        Rc::clone(self.cells.borrow_mut().entry(name.to_string()).or_default())
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.cells
            .borrow()
            .get(name)
            .is_some_and(|cell| cell.initialized())
    }
}

impl ModuleRuntime {
    /// Make sure `name` and every chunk it depends on have been evaluated
    ///
    /// Dependencies are loaded first, in manifest order.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` or one of its dependencies is not in the
    /// manifest, cannot be fetched, or fails to evaluate.
    pub async fn ensure_chunk(&self, name: &str) -> Result<()> {
        for chunk in self.load_order(name)? {
            self.load_once(&chunk).await?;
        }
        Ok(())
    }

    /// [`ensure_chunk`](Self::ensure_chunk) without suspending, for loads
    /// started from module code
    ///
    /// # Errors
    ///
    /// As for `ensure_chunk`, and [`RuntimeError::NoSyncFetch`] when the
    /// installed fetcher cannot read synchronously.
    pub fn ensure_chunk_now(&self, name: &str) -> Result<()> {
        for chunk in self.load_order(name)? {
            if self.is_chunk_loaded(&chunk) {
                continue;
            }
            let (file, fetcher) = self.chunk_source(&chunk)?;
            let code = fetcher
                .fetch_now(&file)
                .ok_or_else(|| RuntimeError::NoSyncFetch(chunk.clone()))??;
            tracing::debug!(chunk = %chunk, file = %file, "loading chunk from module code");
            self.evaluate_chunk(&code, &file)?;
            // Fails harmlessly if an async load of this chunk got there first
            let _ = self.inner.loads.cell(&chunk).set(());
        }
        Ok(())
    }

    /// Dependencies of `name` followed by `name` itself
    fn load_order(&self, name: &str) -> Result<Vec<String>> {
        let manifest = self.inner.manifest.borrow();
        let mut order = manifest
            .get(name)
            .ok_or_else(|| RuntimeError::ChunkNotFound(name.to_string()))?
            .dependencies
            .clone();
        order.push(name.to_string());
        Ok(order)
    }

    fn chunk_source(&self, name: &str) -> Result<(String, Rc<dyn ChunkFetcher>)> {
        let file = self
            .inner
            .manifest
            .borrow()
            .get(name)
            .map(|chunk| chunk.file.clone())
            .ok_or_else(|| RuntimeError::ChunkNotFound(name.to_string()))?;
        let fetcher = self
            .inner
            .fetcher
            .borrow()
            .clone()
            .ok_or_else(|| RuntimeError::NoChunkFetcher(name.to_string()))?;
        Ok((file, fetcher))
    }

    pub fn is_chunk_loaded(&self, name: &str) -> bool {
        self.inner.loads.is_loaded(name)
    }

    async fn load_once(&self, name: &str) -> Result<()> {
        let cell = self.inner.loads.cell(name);
        cell.get_or_try_init(|| self.load_chunk(name)).await?;
        Ok(())
    }

    /// Fetch and evaluate a single chunk, bypassing the load cache
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk is not in the manifest, no fetcher is
    /// installed, or fetching or evaluation fails.
    pub async fn load_chunk(&self, name: &str) -> Result<()> {
        let (file, fetcher) = self.chunk_source(name)?;

        tracing::debug!(chunk = name, file = %file, "loading chunk");
        let code = fetcher.fetch(&file).await?;
        self.evaluate_chunk(&code, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{build_manifest, Chunk};
    use crate::sandbox::SandboxConfig;
    use std::cell::Cell;

    /// Serves fixed chunk code and counts fetches per file
    #[derive(Default)]
    struct CountingFetcher {
        files: FxHashMap<String, String>,
        fetches: RefCell<Vec<String>>,
        fail_next: Cell<bool>,
    }

    impl CountingFetcher {
        fn file(mut self, name: &str, code: &str) -> Self {
            self.files.insert(name.to_string(), code.to_string());
            self
        }

        fn count(&self, file: &str) -> usize {
            self.fetches.borrow().iter().filter(|f| *f == file).count()
        }
    }

    impl ChunkFetcher for CountingFetcher {
        fn fetch<'a>(&'a self, file: &'a str) -> FetchFuture<'a> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.fetches.borrow_mut().push(file.to_string());
                if self.fail_next.replace(false) {
                    return Err(RuntimeError::ChunkFetch {
                        file: file.to_string(),
                        source: std::io::Error::other("connection reset"),
                    });
                }
                self.files
                    .get(file)
                    .cloned()
                    .ok_or_else(|| RuntimeError::ChunkFetch {
                        file: file.to_string(),
                        source: std::io::ErrorKind::NotFound.into(),
                    })
            })
        }
    }

    fn define_chunk(id: &str) -> String {
        format!(
            "runtime:define(\"{id}\", function(require, module, exports) exports.name = \"{id}\" end)"
        )
    }

    fn runtime_with(fetcher: Rc<CountingFetcher>) -> ModuleRuntime {
        let runtime = ModuleRuntime::new(SandboxConfig::default()).unwrap();
        let chunks = vec![
            Chunk::new("page", "page.lua").with_imports(["shared"]),
            Chunk::new("shared", "shared.lua"),
        ];
        runtime.set_manifest(build_manifest(&chunks));
        runtime.set_chunk_fetcher(fetcher);
        runtime
    }

    fn fetcher() -> CountingFetcher {
        CountingFetcher::default()
            .file("page.lua", &define_chunk("src/page.lua"))
            .file("shared.lua", &define_chunk("src/shared.lua"))
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_load() {
        let fetcher = Rc::new(fetcher());
        let runtime = runtime_with(Rc::clone(&fetcher));

        let (first, second) = tokio::join!(
            runtime.ensure_chunk("page"),
            runtime.ensure_chunk("page")
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(fetcher.count("page.lua"), 1);
        assert_eq!(fetcher.count("shared.lua"), 1);
        assert!(runtime.is_chunk_loaded("page"));
    }

    #[tokio::test]
    async fn test_dependencies_load_before_the_chunk() {
        let fetcher = Rc::new(fetcher());
        let runtime = runtime_with(Rc::clone(&fetcher));

        runtime.ensure_chunk("page").await.unwrap();

        assert_eq!(
            *fetcher.fetches.borrow(),
            vec!["shared.lua".to_string(), "page.lua".to_string()]
        );
        assert!(runtime.is_defined("src/shared.lua"));
        assert!(runtime.is_defined("src/page.lua"));
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let fetcher = Rc::new(fetcher());
        let runtime = runtime_with(Rc::clone(&fetcher));

        runtime.ensure_chunk("shared").await.unwrap();
        runtime.ensure_chunk("shared").await.unwrap();

        assert_eq!(fetcher.count("shared.lua"), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let fetcher = Rc::new(fetcher());
        fetcher.fail_next.set(true);
        let runtime = runtime_with(Rc::clone(&fetcher));

        assert!(runtime.ensure_chunk("shared").await.is_err());
        assert!(!runtime.is_chunk_loaded("shared"));

        runtime.ensure_chunk("shared").await.unwrap();
        assert_eq!(fetcher.count("shared.lua"), 2);
        assert!(runtime.is_chunk_loaded("shared"));
    }

    #[tokio::test]
    async fn test_unknown_chunk() {
        let runtime = runtime_with(Rc::new(fetcher()));
        let err = runtime.ensure_chunk("missing").await.unwrap_err();
        assert!(matches!(err, RuntimeError::ChunkNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_missing_fetcher() {
        let runtime = ModuleRuntime::new(SandboxConfig::default()).unwrap();
        runtime.set_manifest(build_manifest(&[Chunk::new("solo", "solo.lua")]));

        let err = runtime.load_chunk("solo").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NoChunkFetcher(_)));
    }

    #[tokio::test]
    async fn test_fs_fetcher_reads_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("solo.lua"), define_chunk("src/solo.lua")).unwrap();

        let runtime = ModuleRuntime::new(SandboxConfig::default()).unwrap();
        runtime.set_manifest(build_manifest(&[Chunk::new("solo", "solo.lua")]));
        runtime.set_chunk_fetcher(Rc::new(FsChunkFetcher::new(dir.path())));

        runtime.ensure_chunk("solo").await.unwrap();
        let exports = runtime.require("src/solo.lua").unwrap();
        let name: String = exports.as_table().unwrap().get("name").unwrap();
        assert_eq!(name, "src/solo.lua");
    }

    #[test]
    fn test_module_code_loads_chunks_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.lua"), define_chunk("src/page.lua")).unwrap();
        std::fs::write(dir.path().join("shared.lua"), define_chunk("src/shared.lua")).unwrap();

        let runtime = ModuleRuntime::new(SandboxConfig::default()).unwrap();
        let chunks = vec![
            Chunk::new("page", "page.lua").with_imports(["shared"]),
            Chunk::new("shared", "shared.lua"),
        ];
        runtime.set_manifest(build_manifest(&chunks));
        runtime.set_chunk_fetcher(Rc::new(FsChunkFetcher::new(dir.path())));

        runtime
            .evaluate_chunk("runtime:ensure_chunk(\"page\")", "boot.lua")
            .unwrap();

        assert!(runtime.is_chunk_loaded("shared"));
        assert!(runtime.is_chunk_loaded("page"));
        assert!(runtime.is_defined("src/page.lua"));

        // already loaded chunks are not evaluated again
        std::fs::remove_file(dir.path().join("page.lua")).unwrap();
        runtime.ensure_chunk_now("page").unwrap();
    }

    #[test]
    fn test_sync_load_needs_a_sync_fetcher() {
        let runtime = runtime_with(Rc::new(fetcher()));
        let err = runtime.ensure_chunk_now("shared").unwrap_err();
        assert!(matches!(err, RuntimeError::NoSyncFetch(name) if name == "shared"));
        assert!(!runtime.is_chunk_loaded("shared"));
    }
}
