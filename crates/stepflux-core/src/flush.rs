//! Flush scheduling.
//!
//! Walks a dirty subtree parents-first and drains each node's pending work
//! into backend tasks: container creation, dataset declaration, attribute
//! writes, then chunk writes in the order they were stored. A task leaves its
//! queue only after the backend acknowledged it, so a retried flush sends
//! exactly the work that is still outstanding.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendTarget};
use crate::error::{FlushFailure, StepfluxError, StepfluxResult};
use crate::hierarchy::{Hierarchy, NodeId};

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Nodes whose own work was attempted
    pub nodes_flushed: u64,
    /// Backend tasks acknowledged
    pub tasks_dispatched: u64,
    /// Nodes skipped because their parent container is missing
    pub nodes_skipped: u64,
    /// Nodes left dirty, with the reason
    #[serde(skip)]
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    /// True when every visited node was fully committed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Merges another pass into this one.
    pub fn absorb(&mut self, other: FlushReport) {
        self.nodes_flushed += other.nodes_flushed;
        self.tasks_dispatched += other.tasks_dispatched;
        self.nodes_skipped += other.nodes_skipped;
        self.failures.extend(other.failures);
    }

    /// Converts failures into the aggregate error.
    pub fn into_result(self) -> StepfluxResult<FlushReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(StepfluxError::FlushFailed {
                failures: self.failures,
            })
        }
    }
}

/// Partial progress of a node that failed mid-way.
struct NodeFailure {
    tasks: u64,
    error: StepfluxError,
    container_exists: bool,
}

/// Drains dirty nodes of a hierarchy into a backend.
pub struct FlushScheduler<'a, B: Backend> {
    backend: &'a B,
    target: &'a BackendTarget,
}

impl<'a, B: Backend> FlushScheduler<'a, B> {
    /// Scheduler writing into `target` through `backend`.
    pub fn new(backend: &'a B, target: &'a BackendTarget) -> Self {
        Self { backend, target }
    }

    /// Flushes the subtree rooted at `root`. A clean subtree issues no backend calls.
    ///
    /// The container of `root`'s parent must already exist in the target.
    pub async fn flush_subtree(&self, tree: &mut Hierarchy, root: NodeId) -> FlushReport {
        let order = tree.preorder(root);
        let dirty = dirty_map(tree, &order);
        let mut report = FlushReport::default();
        let mut blocked: HashSet<NodeId> = HashSet::new();

        for id in order {
            if !dirty.get(&id).copied().unwrap_or(false) {
                continue;
            }
            let Ok(node) = tree.node(id) else {
                continue;
            };
            if let Some(parent) = node.parent() {
                if blocked.contains(&parent) {
                    blocked.insert(id);
                    report.nodes_skipped += 1;
                    continue;
                }
            }
            if !node.is_dirty() && node.in_backend() {
                continue;
            }

            report.nodes_flushed += 1;
            match self.flush_node(tree, id).await {
                Ok(tasks) => {
                    report.tasks_dispatched += tasks;
                    if let Ok(n) = tree.node_mut(id) {
                        n.dirty = false;
                    }
                }
                Err(failure) => {
                    let path = tree.path(id);
                    warn!(%path, file = %self.target, error = %failure.error, "node flush failed");
                    report.tasks_dispatched += failure.tasks;
                    if !failure.container_exists {
                        blocked.insert(id);
                    }
                    report.failures.push(FlushFailure {
                        path,
                        reason: failure.error.to_string(),
                    });
                }
            }
        }

        if report.tasks_dispatched > 0 || !report.failures.is_empty() {
            info!(
                file = %self.target,
                root = %tree.path(root),
                nodes = report.nodes_flushed,
                tasks = report.tasks_dispatched,
                failed = report.failures.len(),
                "flush pass finished"
            );
        }
        report
    }

    /// Flushes the ancestors of `id` (their own work only), then the subtree of `id`.
    pub async fn flush_branch(&self, tree: &mut Hierarchy, id: NodeId) -> FlushReport {
        let mut chain = Vec::new();
        let mut cur = tree.node(id).ok().and_then(|n| n.parent());
        while let Some(c) = cur {
            chain.push(c);
            cur = tree.node(c).ok().and_then(|n| n.parent());
        }

        let mut report = FlushReport::default();
        for ancestor in chain.into_iter().rev() {
            let Ok(node) = tree.node(ancestor) else {
                continue;
            };
            if !node.is_dirty() && node.in_backend() {
                continue;
            }
            report.nodes_flushed += 1;
            match self.flush_node(tree, ancestor).await {
                Ok(tasks) => {
                    report.tasks_dispatched += tasks;
                    if let Ok(n) = tree.node_mut(ancestor) {
                        n.dirty = false;
                    }
                }
                Err(failure) => {
                    let path = tree.path(ancestor);
                    warn!(%path, file = %self.target, error = %failure.error, "ancestor flush failed");
                    report.tasks_dispatched += failure.tasks;
                    report.failures.push(FlushFailure {
                        path,
                        reason: failure.error.to_string(),
                    });
                    if !failure.container_exists {
                        report.nodes_skipped += tree.preorder(id).len() as u64;
                        return report;
                    }
                }
            }
        }
        report.absorb(self.flush_subtree(tree, id).await);
        report
    }

    async fn flush_node(&self, tree: &mut Hierarchy, id: NodeId) -> Result<u64, NodeFailure> {
        let path = tree.path(id);
        let mut tasks = 0u64;
        let fail = |tasks: u64, error: StepfluxError, container_exists: bool| NodeFailure {
            tasks,
            error,
            container_exists,
        };
        let node_err = |e: StepfluxError| NodeFailure {
            tasks: 0,
            error: e,
            container_exists: true,
        };

        let handle = match tree.node(id).map_err(node_err)?.handle {
            Some(h) => h,
            None => {
                let h = self
                    .backend
                    .create_container(self.target, &path)
                    .await
                    .map_err(|e| fail(tasks, e, false))?;
                tree.node_mut(id).map_err(node_err)?.handle = Some(h);
                debug!(%path, "container task done");
                tasks += 1;
                h
            }
        };

        let declare = tree.node(id).map_err(node_err)?.component.as_ref().and_then(|c| {
            (!c.constant && !c.dataset_written)
                .then(|| c.dataset.clone())
                .flatten()
        });
        if let Some(dataset) = declare {
            self.backend
                .declare_dataset(handle, &dataset)
                .await
                .map_err(|e| fail(tasks, e, true))?;
            if let Some(c) = tree.node_mut(id).map_err(node_err)?.component.as_mut() {
                c.dataset_written = true;
            }
            debug!(%path, extent = ?dataset.extent, "dataset task done");
            tasks += 1;
        }

        loop {
            let next = {
                let node = tree.node(id).map_err(node_err)?;
                node.pending_attributes
                    .front()
                    .and_then(|name| node.attributes.get(name).map(|v| (name.clone(), v.clone())))
            };
            let Some((name, value)) = next else {
                break;
            };
            self.backend
                .write_attribute(handle, &name, &value)
                .await
                .map_err(|e| fail(tasks, e, true))?;
            tree.node_mut(id).map_err(node_err)?.pending_attributes.pop_front();
            debug!(%path, attribute = %name, "attribute task done");
            tasks += 1;
        }

        // A constant's shape attribute stands in for its dataset declaration.
        let node = tree.node_mut(id).map_err(node_err)?;
        let shape_sent = !node.pending_attributes.iter().any(|n| n == "shape");
        if let Some(c) = node.component.as_mut() {
            if c.constant && shape_sent {
                c.dataset_written = true;
            }
        }

        loop {
            let next = tree
                .node(id)
                .map_err(node_err)?
                .component
                .as_ref()
                .and_then(|c| c.chunks.front().cloned());
            let Some(chunk) = next else {
                break;
            };
            self.backend
                .write_chunk(handle, &chunk.data, &chunk.offset, &chunk.extent)
                .await
                .map_err(|e| fail(tasks, e, true))?;
            if let Some(c) = tree.node_mut(id).map_err(node_err)?.component.as_mut() {
                c.chunks.pop_front();
            }
            debug!(%path, offset = ?chunk.offset, extent = ?chunk.extent, "chunk task done");
            tasks += 1;
        }

        Ok(tasks)
    }
}

/// Recursive dirtiness of every node in `order`, computed bottom-up.
fn dirty_map(tree: &Hierarchy, order: &[NodeId]) -> HashMap<NodeId, bool> {
    let mut map = HashMap::with_capacity(order.len());
    for id in order.iter().rev() {
        let Ok(node) = tree.node(*id) else {
            continue;
        };
        let d = node.is_dirty()
            || node
                .children()
                .iter()
                .any(|c| map.get(c).copied().unwrap_or(false));
        map.insert(*id, d);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOpKind, MemoryBackend};
    use crate::datatype::{ChunkBuffer, Dataset, Datatype};
    use crate::hierarchy::NodeKind;

    struct Fixture {
        tree: Hierarchy,
        it: NodeId,
        rho: NodeId,
        ex: NodeId,
    }

    fn fixture() -> Fixture {
        let mut tree = Hierarchy::new();
        let (it, _) = tree.get_or_create_iteration(1).unwrap();
        let (fields, _) = tree.get_or_create(it, "fields", NodeKind::Meshes).unwrap();
        let (rho_mesh, _) = tree.get_or_create(fields, "rho", NodeKind::Mesh).unwrap();
        let (rho, _) = tree.get_or_create(rho_mesh, "scalar", NodeKind::Component).unwrap();
        let (e_mesh, _) = tree.get_or_create(fields, "E", NodeKind::Mesh).unwrap();
        let (ex, _) = tree.get_or_create(e_mesh, "x", NodeKind::Component).unwrap();
        for c in [rho, ex] {
            tree.declare_dataset(c, Dataset::new(Datatype::Float64, vec![8])).unwrap();
        }
        Fixture { tree, it, rho, ex }
    }

    fn target() -> BackendTarget {
        BackendTarget::new("flush.json")
    }

    #[tokio::test]
    async fn test_flush_commits_everything() {
        let mut f = fixture();
        f.tree.set_attribute(f.it, "time", 0.5.into()).unwrap();
        f.tree
            .store_chunk(f.rho, ChunkBuffer::from(vec![1.0f64; 4]), vec![0], vec![4])
            .unwrap();

        let be = MemoryBackend::new();
        let t = target();
        let root = f.tree.root();
        let report = FlushScheduler::new(&be, &t).flush_subtree(&mut f.tree, root).await;
        assert!(report.is_clean());
        assert!(!f.tree.is_dirty_recursive(f.tree.root()));
        assert_eq!(be.attribute(&t, "/data/1", "time").await, Some(0.5.into()));
        assert_eq!(f.tree.node(f.rho).unwrap().pending_chunks(), 0);
        // root, iteration, fields, rho, rho/scalar, E, E/x
        assert_eq!(be.stats().containers_created, 7);
        assert_eq!(be.stats().datasets_declared, 2);
    }

    #[tokio::test]
    async fn test_clean_flush_is_noop() {
        let mut f = fixture();
        let be = MemoryBackend::new();
        let t = target();
        let sched = FlushScheduler::new(&be, &t);
        let root = f.tree.root();
        sched.flush_subtree(&mut f.tree, root).await;
        let calls = be.stats().total_calls();

        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert_eq!(report.tasks_dispatched, 0);
        assert_eq!(be.stats().total_calls(), calls);
    }

    #[tokio::test]
    async fn test_parent_created_before_child() {
        let mut f = fixture();
        let be = MemoryBackend::new();
        let t = target();
        let root = f.tree.root();
        FlushScheduler::new(&be, &t).flush_subtree(&mut f.tree, root).await;

        let creates: Vec<String> = be
            .op_log()
            .await
            .into_iter()
            .filter(|o| o.kind == BackendOpKind::CreateContainer)
            .map(|o| o.path)
            .collect();
        for (i, p) in creates.iter().enumerate() {
            for q in &creates[i + 1..] {
                assert!(!p.starts_with(&format!("{}/", q)), "{} created before parent {}", p, q);
            }
        }
    }

    #[tokio::test]
    async fn test_chunks_dispatched_fifo() {
        let mut f = fixture();
        for (i, off) in [4u64, 0, 6].iter().enumerate() {
            f.tree
                .store_chunk(f.rho, ChunkBuffer::from(vec![i as f64; 2]), vec![*off], vec![2])
                .unwrap();
        }
        let be = MemoryBackend::new();
        let t = target();
        let root = f.tree.root();
        FlushScheduler::new(&be, &t).flush_subtree(&mut f.tree, root).await;

        let chunks: Vec<String> = be
            .op_log()
            .await
            .into_iter()
            .filter(|o| o.kind == BackendOpKind::WriteChunk)
            .map(|o| o.detail)
            .collect();
        assert_eq!(chunks, vec!["[4]+[2]", "[0]+[2]", "[6]+[2]"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_node_dirty_and_retries_outstanding_only() {
        let mut f = fixture();
        for off in [0u64, 2, 4] {
            f.tree
                .store_chunk(f.rho, ChunkBuffer::from(vec![1.0f64; 2]), vec![off], vec![2])
                .unwrap();
        }
        let be = MemoryBackend::new();
        let t = target();
        let sched = FlushScheduler::new(&be, &t);

        let root = f.tree.root();
        sched.flush_subtree(&mut f.tree, root).await;
        assert!(!f.tree.is_dirty_recursive(f.tree.root()));
        f.tree
            .store_chunk(f.rho, ChunkBuffer::from(vec![2.0f64; 2]), vec![6], vec![2])
            .unwrap();
        f.tree
            .store_chunk(f.rho, ChunkBuffer::from(vec![3.0f64; 2]), vec![0], vec![2])
            .unwrap();
        be.inject_fault(BackendOpKind::WriteChunk, "/data/1/fields/rho/scalar", 1).await;
        f.tree.set_attribute(f.ex, "unitSI", 1.0.into()).unwrap();

        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "/data/1/fields/rho/scalar");
        assert!(f.tree.node(f.rho).unwrap().is_dirty());
        assert_eq!(f.tree.node(f.rho).unwrap().pending_chunks(), 2);
        assert!(f.tree.is_dirty_recursive(f.it));
        // the sibling still flushed
        assert!(!f.tree.node(f.ex).unwrap().is_dirty());
        assert_eq!(be.attribute(&t, "/data/1/fields/E/x", "unitSI").await, Some(1.0.into()));

        let before = be.stats().chunks_written;
        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert!(report.is_clean());
        assert_eq!(be.stats().chunks_written - before, 2);
        assert!(!f.tree.is_dirty_recursive(f.tree.root()));
        let data = be.dataset_f64(&t, "/data/1/fields/rho/scalar").await.unwrap();
        assert_eq!(data, vec![3.0, 3.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[tokio::test]
    async fn test_failed_container_blocks_descendants() {
        let mut f = fixture();
        let be = MemoryBackend::new();
        be.inject_fault(BackendOpKind::CreateContainer, "/data/1/fields/E", 1).await;
        let t = target();
        let sched = FlushScheduler::new(&be, &t);

        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.nodes_skipped, 1);
        assert!(!be.has_container(&t, "/data/1/fields/E/x").await);
        assert!(be.has_container(&t, "/data/1/fields/rho/scalar").await);
        assert!(report.clone().into_result().is_err());

        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert!(report.is_clean());
        assert!(be.has_container(&t, "/data/1/fields/E/x").await);
    }

    #[tokio::test]
    async fn test_attribute_failure_retried_in_order() {
        let mut f = fixture();
        let be = MemoryBackend::new();
        let t = target();
        let sched = FlushScheduler::new(&be, &t);
        let root = f.tree.root();
        sched.flush_subtree(&mut f.tree, root).await;

        f.tree.set_attribute(f.it, "time", 1.0.into()).unwrap();
        f.tree.set_attribute(f.it, "dt", 1.0.into()).unwrap();
        be.inject_fault(BackendOpKind::WriteAttribute, "/data/1", 1).await;
        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert_eq!(report.failures.len(), 1);
        assert!(f.tree.node(f.it).unwrap().attribute_pending("time"));
        assert!(f.tree.node(f.it).unwrap().attribute_pending("dt"));

        let log_len = be.op_log().await.len();
        let root = f.tree.root();
        let report = sched.flush_subtree(&mut f.tree, root).await;
        assert!(report.is_clean());
        let written: Vec<String> = be.op_log().await[log_len..]
            .iter()
            .filter(|o| o.kind == BackendOpKind::WriteAttribute)
            .map(|o| o.detail.clone())
            .collect();
        assert_eq!(written, vec!["time", "dt"]);
    }

    #[tokio::test]
    async fn test_branch_creates_ancestors_only() {
        let mut f = fixture();
        let (it2, _) = f.tree.get_or_create_iteration(2).unwrap();
        let be = MemoryBackend::new();
        let t = target();

        let report = FlushScheduler::new(&be, &t).flush_branch(&mut f.tree, f.ex).await;
        assert!(report.is_clean());
        assert!(be.has_container(&t, "/").await);
        assert!(be.has_container(&t, "/data/1/fields/E/x").await);
        assert!(!be.has_container(&t, "/data/1/fields/rho").await);
        assert!(!be.has_container(&t, "/data/2").await);
        assert!(f.tree.node(it2).unwrap().is_dirty());
        assert!(f.tree.is_dirty_recursive(f.tree.root()));
    }
}
