//! JSON dump engine.
//!
//! Stores everything through a [`MemoryBackend`] and serializes a target as one
//! pretty-printed JSON document when its root container (`/`) is closed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::backend::{Backend, BackendHandle, BackendStats, BackendTarget, MemoryBackend};
use crate::datatype::{AttributeValue, ChunkBuffer, Dataset};
use crate::error::StepfluxResult;

/// Backend that writes `<dir>/<target>.json` per closed target.
pub struct JsonBackend {
    store: MemoryBackend,
    dir: PathBuf,
    write_lock: AsyncMutex<()>,
    files_written: AtomicU64,
}

impl JsonBackend {
    /// Engine writing documents below `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: MemoryBackend::new(),
            dir: dir.into(),
            write_lock: AsyncMutex::new(()),
            files_written: AtomicU64::new(0),
        }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// In-memory view of everything written so far.
    pub fn store(&self) -> &MemoryBackend {
        &self.store
    }

    /// Number of documents written.
    pub fn files_written(&self) -> u64 {
        self.files_written.load(Ordering::Relaxed)
    }

    /// File a target is dumped to.
    pub fn document_path(&self, target: &BackendTarget) -> PathBuf {
        let mut path = self.dir.join(target.as_str());
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            let mut name = path.as_os_str().to_os_string();
            name.push(".json");
            path = PathBuf::from(name);
        }
        path
    }

    async fn dump(&self, target: &BackendTarget) -> StepfluxResult<()> {
        let _guard = self.write_lock.lock().await;
        let doc = self.store.snapshot(target).await;
        let path = self.document_path(target);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_vec_pretty(&doc)?;
        tokio::fs::write(&path, &text).await?;
        self.files_written.fetch_add(1, Ordering::Relaxed);
        info!(file = %target, path = %path.display(), bytes = text.len(), "target written");
        Ok(())
    }
}

impl Backend for JsonBackend {
    async fn create_container(&self, target: &BackendTarget, path: &str) -> StepfluxResult<BackendHandle> {
        self.store.create_container(target, path).await
    }

    async fn declare_dataset(&self, handle: BackendHandle, dataset: &Dataset) -> StepfluxResult<()> {
        self.store.declare_dataset(handle, dataset).await
    }

    async fn write_attribute(&self, handle: BackendHandle, name: &str, value: &AttributeValue) -> StepfluxResult<()> {
        self.store.write_attribute(handle, name, value).await
    }

    async fn write_chunk(
        &self,
        handle: BackendHandle,
        data: &ChunkBuffer,
        offset: &[u64],
        extent: &[u64],
    ) -> StepfluxResult<()> {
        self.store.write_chunk(handle, data, offset, extent).await
    }

    async fn close_container(&self, handle: BackendHandle, collective: bool) -> StepfluxResult<()> {
        let location = self.store.handle_location(handle).await;
        self.store.close_container(handle, collective).await?;
        match location {
            Some((target, path)) if path == "/" => self.dump(&target).await,
            Some((target, path)) => {
                debug!(file = %target, %path, "container closed, dump deferred to root");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn stats(&self) -> BackendStats {
        self.store.stats()
    }
}
