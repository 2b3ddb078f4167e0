//! Backend engine abstraction.
//!
//! The write path talks to storage only through the [`Backend`] trait. Engines
//! are shared by every rank of a run and must accept concurrent writes into
//! disjoint regions of the same dataset. [`MemoryBackend`] keeps everything in
//! memory, records an operation log, and can inject failures for testing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::datatype::{AttributeValue, ChunkBuffer, Dataset, Datatype};
use crate::error::{StepfluxError, StepfluxResult};
use crate::hierarchy::RESERVED_NAMES;

/// Opaque id of an open backend container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle(pub u64);

/// File-level object a backend opens: one per iteration or one per run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendTarget(String);

impl BackendTarget {
    /// Wraps a resolved target name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Target name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Container create calls that succeeded
    pub containers_created: u64,
    /// Dataset declarations that succeeded
    pub datasets_declared: u64,
    /// Attribute writes that succeeded
    pub attributes_written: u64,
    /// Chunk writes that succeeded
    pub chunks_written: u64,
    /// Payload bytes written
    pub bytes_written: u64,
    /// Container closes that succeeded
    pub closes: u64,
    /// Failed calls
    pub errors: u64,
}

impl BackendStats {
    /// Total successful calls.
    pub fn total_calls(&self) -> u64 {
        self.containers_created + self.datasets_declared + self.attributes_written + self.chunks_written + self.closes
    }
}

/// Capability set every storage engine provides.
pub trait Backend: Send + Sync {
    /// Creates (or opens, if it already exists) the container at `path` in `target`.
    fn create_container(
        &self,
        target: &BackendTarget,
        path: &str,
    ) -> impl Future<Output = StepfluxResult<BackendHandle>> + Send;

    /// Declares the dataset carried by a container.
    fn declare_dataset(
        &self,
        handle: BackendHandle,
        dataset: &Dataset,
    ) -> impl Future<Output = StepfluxResult<()>> + Send;

    /// Writes one attribute.
    fn write_attribute(
        &self,
        handle: BackendHandle,
        name: &str,
        value: &AttributeValue,
    ) -> impl Future<Output = StepfluxResult<()>> + Send;

    /// Writes one chunk into the container's dataset.
    fn write_chunk(
        &self,
        handle: BackendHandle,
        data: &ChunkBuffer,
        offset: &[u64],
        extent: &[u64],
    ) -> impl Future<Output = StepfluxResult<()>> + Send;

    /// Closes a container. `collective` is set when every rank closes it together.
    fn close_container(
        &self,
        handle: BackendHandle,
        collective: bool,
    ) -> impl Future<Output = StepfluxResult<()>> + Send;

    /// Current statistics.
    fn stats(&self) -> BackendStats;
}

/// Atomic counter for backend handles.
#[derive(Debug)]
pub struct HandleIdGen {
    next: AtomicU64,
}

impl HandleIdGen {
    /// Create a new generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next unique handle.
    pub fn next_handle(&self) -> BackendHandle {
        BackendHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of backend call, used by the op log and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendOpKind {
    /// `create_container`
    CreateContainer,
    /// `declare_dataset`
    DeclareDataset,
    /// `write_attribute`
    WriteAttribute,
    /// `write_chunk`
    WriteChunk,
    /// `close_container`
    CloseContainer,
}

/// One successful backend call as recorded by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOp {
    /// Call kind
    pub kind: BackendOpKind,
    /// Target the container lives in
    pub target: BackendTarget,
    /// Container path
    pub path: String,
    /// Attribute name, chunk offset, or collective flag rendered as text
    pub detail: String,
}

#[derive(Debug)]
struct StoredDataset {
    datatype: Datatype,
    extent: Vec<u64>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Container {
    attributes: BTreeMap<String, AttributeValue>,
    dataset: Option<StoredDataset>,
}

#[derive(Debug)]
struct OpenHandle {
    key: (BackendTarget, String),
    open: bool,
}

#[derive(Debug)]
struct FaultRule {
    kind: BackendOpKind,
    path_prefix: String,
    remaining: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<(BackendTarget, String), Container>,
    handles: HashMap<BackendHandle, OpenHandle>,
    log: Vec<BackendOp>,
    faults: Vec<FaultRule>,
}

impl MemoryState {
    fn take_fault(&mut self, kind: BackendOpKind, path: &str) -> bool {
        for rule in self.faults.iter_mut() {
            if rule.kind == kind && rule.remaining > 0 && path.starts_with(&rule.path_prefix) {
                rule.remaining -= 1;
                return true;
            }
        }
        false
    }

    fn open_key(&self, handle: BackendHandle, op: &'static str) -> StepfluxResult<(BackendTarget, String)> {
        match self.handles.get(&handle) {
            Some(h) if h.open => Ok(h.key.clone()),
            Some(h) => Err(StepfluxError::backend(op, h.key.1.clone(), "handle already closed")),
            None => Err(StepfluxError::backend(op, format!("{:?}", handle), "unknown handle")),
        }
    }

    fn record(&mut self, kind: BackendOpKind, key: &(BackendTarget, String), detail: String) {
        self.log.push(BackendOp {
            kind,
            target: key.0.clone(),
            path: key.1.clone(),
            detail,
        });
    }
}

/// In-memory engine shared by all ranks of a run.
pub struct MemoryBackend {
    state: AsyncMutex<MemoryState>,
    stats: std::sync::Mutex<BackendStats>,
    ids: HandleIdGen,
}

impl MemoryBackend {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            state: AsyncMutex::new(MemoryState::default()),
            stats: std::sync::Mutex::new(BackendStats::default()),
            ids: HandleIdGen::new(),
        }
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut BackendStats),
    {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn injected(&self, op: &'static str, path: &str) -> StepfluxError {
        self.update_stats(|s| s.errors += 1);
        StepfluxError::backend(op, path, "injected fault")
    }

    /// Makes the next `times` calls of `kind` on paths starting with `path_prefix` fail.
    pub async fn inject_fault(&self, kind: BackendOpKind, path_prefix: &str, times: u32) {
        let mut state = self.state.lock().await;
        state.faults.push(FaultRule {
            kind,
            path_prefix: path_prefix.to_string(),
            remaining: times,
        });
    }

    /// All successful calls in dispatch order.
    pub async fn op_log(&self) -> Vec<BackendOp> {
        self.state.lock().await.log.clone()
    }

    /// Attribute stored at `path` in `target`.
    pub async fn attribute(&self, target: &BackendTarget, path: &str, name: &str) -> Option<AttributeValue> {
        let state = self.state.lock().await;
        state
            .containers
            .get(&(target.clone(), path.to_string()))
            .and_then(|c| c.attributes.get(name).cloned())
    }

    /// Raw dataset contents at `path` in `target`.
    pub async fn dataset_bytes(&self, target: &BackendTarget, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .containers
            .get(&(target.clone(), path.to_string()))
            .and_then(|c| c.dataset.as_ref().map(|d| d.data.clone()))
    }

    /// Dataset contents decoded as `f64`.
    pub async fn dataset_f64(&self, target: &BackendTarget, path: &str) -> Option<Vec<f64>> {
        let raw = self.dataset_bytes(target, path).await?;
        Some(
            raw.chunks_exact(8)
                .map(|b| {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(b);
                    f64::from_le_bytes(a)
                })
                .collect(),
        )
    }

    /// True when a container exists at `path` in `target`.
    pub async fn has_container(&self, target: &BackendTarget, path: &str) -> bool {
        let state = self.state.lock().await;
        state.containers.contains_key(&(target.clone(), path.to_string()))
    }

    /// Targets that hold at least one container.
    pub async fn targets(&self) -> Vec<BackendTarget> {
        let state = self.state.lock().await;
        let mut out: Vec<BackendTarget> = state.containers.keys().map(|(t, _)| t.clone()).collect();
        out.dedup();
        out
    }

    /// Location of an issued handle.
    pub async fn handle_location(&self, handle: BackendHandle) -> Option<(BackendTarget, String)> {
        let state = self.state.lock().await;
        state.handles.get(&handle).map(|h| h.key.clone())
    }

    /// Renders every container of `target` as one nested JSON document.
    pub async fn snapshot(&self, target: &BackendTarget) -> serde_json::Value {
        let state = self.state.lock().await;
        let mut root = serde_json::Map::new();
        'containers: for ((t, path), container) in state.containers.range((target.clone(), String::new())..) {
            if t != target {
                break;
            }
            let mut node = &mut root;
            for (depth, part) in path.split('/').filter(|p| !p.is_empty()).enumerate() {
                // `/data` is the iteration base group; below it the field keys are taken
                if depth > 0 && RESERVED_NAMES.contains(&part) {
                    warn!(file = %target, %path, segment = part, "container name collides with a field key, left out");
                    continue 'containers;
                }
                let entry = node
                    .entry(part.to_string())
                    .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
                let serde_json::Value::Object(m) = entry else {
                    warn!(file = %target, %path, segment = part, "container name collides with a field key, left out");
                    continue 'containers;
                };
                node = m;
            }
            if !container.attributes.is_empty() {
                node.insert(
                    "attributes".to_string(),
                    serde_json::to_value(&container.attributes).unwrap_or_default(),
                );
            }
            if let Some(ds) = &container.dataset {
                node.insert(
                    "datatype".to_string(),
                    serde_json::Value::String(ds.datatype.to_string()),
                );
                node.insert("extent".to_string(), serde_json::json!(ds.extent));
                node.insert(
                    "data".to_string(),
                    serde_json::Value::Array(ds.datatype.decode_json(&ds.data)),
                );
            }
        }
        serde_json::Value::Object(root)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies a row-major chunk into a row-major dataset buffer.
fn copy_region(dst: &mut [u8], shape: &[u64], src: &[u8], offset: &[u64], extent: &[u64], elem: usize) {
    let rank = shape.len();
    if rank == 0 {
        return;
    }
    let mut strides = vec![1u64; rank];
    for d in (0..rank - 1).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    let row_len = extent[rank - 1] as usize * elem;
    let rows: u64 = extent[..rank - 1].iter().product();
    let mut idx = vec![0u64; rank - 1];

    for row in 0..rows as usize {
        let mut start = offset[rank - 1];
        for d in 0..rank - 1 {
            start += (offset[d] + idx[d]) * strides[d];
        }
        let dst_start = start as usize * elem;
        let src_start = row * row_len;
        dst[dst_start..dst_start + row_len].copy_from_slice(&src[src_start..src_start + row_len]);

        for d in (0..rank - 1).rev() {
            idx[d] += 1;
            if idx[d] < extent[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

impl Backend for MemoryBackend {
    async fn create_container(&self, target: &BackendTarget, path: &str) -> StepfluxResult<BackendHandle> {
        let mut state = self.state.lock().await;
        if state.take_fault(BackendOpKind::CreateContainer, path) {
            return Err(self.injected("create_container", path));
        }
        let key = (target.clone(), path.to_string());
        state.containers.entry(key.clone()).or_default();
        let handle = self.ids.next_handle();
        state.handles.insert(handle, OpenHandle { key: key.clone(), open: true });
        state.record(BackendOpKind::CreateContainer, &key, String::new());
        drop(state);

        debug!(file = %target, path, handle = handle.0, "container created");
        self.update_stats(|s| s.containers_created += 1);
        Ok(handle)
    }

    async fn declare_dataset(&self, handle: BackendHandle, dataset: &Dataset) -> StepfluxResult<()> {
        let mut state = self.state.lock().await;
        let key = state.open_key(handle, "declare_dataset")?;
        if state.take_fault(BackendOpKind::DeclareDataset, &key.1) {
            return Err(self.injected("declare_dataset", &key.1));
        }
        let container = state.containers.entry(key.clone()).or_default();
        match &container.dataset {
            Some(existing) if existing.datatype == dataset.datatype && existing.extent == dataset.extent => {}
            Some(existing) => {
                let reason = format!(
                    "dataset already declared as {} {:?}",
                    existing.datatype, existing.extent
                );
                drop(state);
                self.update_stats(|s| s.errors += 1);
                return Err(StepfluxError::backend("declare_dataset", key.1, reason));
            }
            None => {
                let bytes = dataset.num_elements() as usize * dataset.datatype.size_bytes();
                container.dataset = Some(StoredDataset {
                    datatype: dataset.datatype,
                    extent: dataset.extent.clone(),
                    data: vec![0u8; bytes],
                });
            }
        }
        state.record(BackendOpKind::DeclareDataset, &key, format!("{:?}", dataset.extent));
        drop(state);

        self.update_stats(|s| s.datasets_declared += 1);
        Ok(())
    }

    async fn write_attribute(&self, handle: BackendHandle, name: &str, value: &AttributeValue) -> StepfluxResult<()> {
        let mut state = self.state.lock().await;
        let key = state.open_key(handle, "write_attribute")?;
        if state.take_fault(BackendOpKind::WriteAttribute, &key.1) {
            return Err(self.injected("write_attribute", &key.1));
        }
        state
            .containers
            .entry(key.clone())
            .or_default()
            .attributes
            .insert(name.to_string(), value.clone());
        state.record(BackendOpKind::WriteAttribute, &key, name.to_string());
        drop(state);

        self.update_stats(|s| s.attributes_written += 1);
        Ok(())
    }

    async fn write_chunk(
        &self,
        handle: BackendHandle,
        data: &ChunkBuffer,
        offset: &[u64],
        extent: &[u64],
    ) -> StepfluxResult<()> {
        let mut state = self.state.lock().await;
        let key = state.open_key(handle, "write_chunk")?;
        if state.take_fault(BackendOpKind::WriteChunk, &key.1) {
            return Err(self.injected("write_chunk", &key.1));
        }
        let container = state.containers.entry(key.clone()).or_default();
        let Some(ds) = container.dataset.as_mut() else {
            drop(state);
            self.update_stats(|s| s.errors += 1);
            return Err(StepfluxError::backend("write_chunk", key.1, "no dataset declared"));
        };
        let fits = offset.len() == ds.extent.len()
            && extent.len() == ds.extent.len()
            && offset.iter().zip(extent).zip(&ds.extent).all(|((o, e), s)| o + e <= *s);
        if !fits || data.datatype() != ds.datatype {
            drop(state);
            self.update_stats(|s| s.errors += 1);
            return Err(StepfluxError::backend("write_chunk", key.1, "chunk outside dataset"));
        }
        copy_region(
            &mut ds.data,
            &ds.extent,
            data.bytes(),
            offset,
            extent,
            ds.datatype.size_bytes(),
        );
        state.record(BackendOpKind::WriteChunk, &key, format!("{:?}+{:?}", offset, extent));
        drop(state);

        let n = data.bytes().len() as u64;
        self.update_stats(|s| {
            s.chunks_written += 1;
            s.bytes_written += n;
        });
        Ok(())
    }

    async fn close_container(&self, handle: BackendHandle, collective: bool) -> StepfluxResult<()> {
        let mut state = self.state.lock().await;
        let key = state.open_key(handle, "close_container")?;
        if state.take_fault(BackendOpKind::CloseContainer, &key.1) {
            return Err(self.injected("close_container", &key.1));
        }
        if let Some(h) = state.handles.get_mut(&handle) {
            h.open = false;
        }
        state.record(
            BackendOpKind::CloseContainer,
            &key,
            if collective { "collective" } else { "independent" }.to_string(),
        );
        drop(state);

        debug!(file = %key.0, path = %key.1, collective, "container closed");
        self.update_stats(|s| s.closes += 1);
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}
