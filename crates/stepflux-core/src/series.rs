//! The Series root handle.
//!
//! A [`Series`] owns the record hierarchy of one rank, the naming policy that
//! maps iterations to backend targets, and the shared backend. Mutations are
//! buffered in the hierarchy; [`Series::flush`], [`Series::close_iteration`]
//! and [`Series::close`] are the only calls that reach the backend.
//!
//! With more than one rank, closing an iteration with flush, `flush` with
//! iterations awaiting finalization, and `close` are collective: every rank
//! must make the same calls in the same order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendHandle, BackendTarget};
use crate::comm::Communicator;
use crate::config::SeriesConfig;
use crate::datatype::{AttributeValue, ChunkBuffer, Dataset};
use crate::error::{FlushFailure, StepfluxError, StepfluxResult};
use crate::flush::{FlushReport, FlushScheduler};
use crate::hierarchy::{Hierarchy, NodeId, NodeKind};
use crate::iteration::{CloseCell, CloseStatus, Iteration};
use crate::naming::{IterationEncoding, NamingPolicy};

/// Standard version string written to the `openPMD` attribute.
pub const STANDARD_VERSION: &str = "1.1.0";

/// Name of the marker attribute committed when the writer closes an iteration.
pub const CLOSED_MARKER: &str = "closed";

/// Root container of one iteration file.
#[derive(Debug, Default)]
struct FileRoot {
    handle: Option<BackendHandle>,
    /// Series attributes already written into this file.
    sent: BTreeMap<String, AttributeValue>,
}

/// One rank's writing session.
pub struct Series<B: Backend, C: Communicator> {
    backend: Arc<B>,
    comm: C,
    tree: Hierarchy,
    naming: NamingPolicy,
    config: SeriesConfig,
    file_roots: HashMap<u64, FileRoot>,
    finished: bool,
}

impl<B: Backend, C: Communicator> Series<B, C> {
    /// Opens a writing session at `path`. No backend call is made until the first flush.
    pub fn create(path: &str, backend: Arc<B>, comm: C, config: SeriesConfig) -> StepfluxResult<Self> {
        let naming = NamingPolicy::from_path(path)?;
        let mut tree = Hierarchy::new();
        let root = tree.root();

        tree.put_attribute(root, "openPMD", STANDARD_VERSION.into())?;
        tree.put_attribute(root, "openPMDextension", 0u64.into())?;
        tree.put_attribute(root, "basePath", "/data/%T/".into())?;
        tree.put_attribute(root, "meshesPath", format!("{}/", config.meshes_path).into())?;
        tree.put_attribute(root, "particlesPath", format!("{}/", config.particles_path).into())?;
        tree.put_attribute(root, "iterationEncoding", naming.encoding().attribute_value().into())?;
        tree.put_attribute(root, "iterationFormat", naming.iteration_format().into())?;
        tree.put_attribute(root, "software", config.software.clone().into())?;
        if let Some(author) = &config.author {
            tree.put_attribute(root, "author", author.clone().into())?;
        }

        info!(
            path,
            encoding = ?naming.encoding(),
            rank = comm.rank(),
            size = comm.size(),
            "series created"
        );
        Ok(Self {
            backend,
            comm,
            tree,
            naming,
            config,
            file_roots: HashMap::new(),
            finished: false,
        })
    }

    /// Buffered hierarchy.
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.tree
    }

    /// Shared backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Communicator of this rank.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Naming policy derived from the series path.
    pub fn naming(&self) -> &NamingPolicy {
        &self.naming
    }

    /// Session configuration.
    pub fn config(&self) -> &SeriesConfig {
        &self.config
    }

    /// Series root node.
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Returns iteration `index`, creating it with default attributes on first use.
    pub fn iteration(&mut self, index: u64) -> StepfluxResult<Iteration> {
        let (node, created) = self.tree.get_or_create_iteration(index)?;
        if created {
            self.tree.put_attribute(node, "time", 0.0.into())?;
            self.tree.put_attribute(node, "dt", 1.0.into())?;
            self.tree.put_attribute(node, "timeUnitSI", 1.0.into())?;
        }
        let (index, cell) = self.tree.close_cell(node)?;
        Ok(Iteration::new(index, node, cell))
    }

    /// Handles to every iteration in creation order.
    pub fn iterations(&self) -> Vec<Iteration> {
        self.tree
            .iterations()
            .into_iter()
            .filter_map(|node| {
                let (index, cell) = self.tree.close_cell(node).ok()?;
                Some(Iteration::new(index, node, cell))
            })
            .collect()
    }

    /// Returns mesh `name` of an iteration.
    pub fn mesh(&mut self, it: &Iteration, name: &str) -> StepfluxResult<NodeId> {
        let meshes_path = self.config.meshes_path.clone();
        let (meshes, _) = self.tree.get_or_create(it.node(), &meshes_path, NodeKind::Meshes)?;
        let (mesh, created) = self.tree.get_or_create(meshes, name, NodeKind::Mesh)?;
        if created {
            let t = &mut self.tree;
            t.put_attribute(mesh, "geometry", "cartesian".into())?;
            t.put_attribute(mesh, "dataOrder", "C".into())?;
            t.put_attribute(mesh, "axisLabels", vec![String::from("x")].into())?;
            t.put_attribute(mesh, "gridSpacing", vec![1.0].into())?;
            t.put_attribute(mesh, "gridGlobalOffset", vec![0.0].into())?;
            t.put_attribute(mesh, "gridUnitSI", 1.0.into())?;
            t.put_attribute(mesh, "unitDimension", vec![0.0; 7].into())?;
            t.put_attribute(mesh, "timeOffset", 0.0.into())?;
        }
        Ok(mesh)
    }

    /// Returns component `comp` of mesh `mesh`, creating both as needed.
    pub fn mesh_component(&mut self, it: &Iteration, mesh: &str, comp: &str) -> StepfluxResult<NodeId> {
        let mesh = self.mesh(it, mesh)?;
        let (id, created) = self.tree.get_or_create(mesh, comp, NodeKind::Component)?;
        if created {
            self.tree.put_attribute(id, "unitSI", 1.0.into())?;
            self.tree.put_attribute(id, "position", vec![0.0].into())?;
        }
        Ok(id)
    }

    /// Returns particle species `name` of an iteration.
    pub fn species(&mut self, it: &Iteration, name: &str) -> StepfluxResult<NodeId> {
        let particles_path = self.config.particles_path.clone();
        let (particles, _) = self
            .tree
            .get_or_create(it.node(), &particles_path, NodeKind::Particles)?;
        let (species, _) = self.tree.get_or_create(particles, name, NodeKind::Species)?;
        Ok(species)
    }

    /// Returns component `comp` of record `record` of a species, creating the chain as needed.
    pub fn particle_component(
        &mut self,
        it: &Iteration,
        species: &str,
        record: &str,
        comp: &str,
    ) -> StepfluxResult<NodeId> {
        let species = self.species(it, species)?;
        let (rec, created) = self.tree.get_or_create(species, record, NodeKind::Record)?;
        if created {
            self.tree.put_attribute(rec, "unitDimension", vec![0.0; 7].into())?;
            self.tree.put_attribute(rec, "timeOffset", 0.0.into())?;
        }
        let (id, created) = self.tree.get_or_create(rec, comp, NodeKind::Component)?;
        if created {
            self.tree.put_attribute(id, "unitSI", 1.0.into())?;
        }
        Ok(id)
    }

    /// Sets an attribute on any node.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: impl Into<AttributeValue>) -> StepfluxResult<()> {
        self.tree.set_attribute(node, name, value.into())
    }

    /// Declares the dataset of a component.
    pub fn declare_dataset(&mut self, node: NodeId, dataset: Dataset) -> StepfluxResult<()> {
        self.tree.declare_dataset(node, dataset)
    }

    /// Buffers a chunk write.
    pub fn store_chunk(
        &mut self,
        node: NodeId,
        data: impl Into<ChunkBuffer>,
        offset: Vec<u64>,
        extent: Vec<u64>,
    ) -> StepfluxResult<()> {
        self.tree.store_chunk(node, data.into(), offset, extent)
    }

    /// Makes a component constant.
    pub fn make_constant(&mut self, node: NodeId, value: impl Into<AttributeValue>) -> StepfluxResult<()> {
        self.tree.make_constant(node, value.into())
    }

    /// Simulation time of an iteration, in units of `dt`.
    pub fn time(&self, it: &Iteration) -> Option<f64> {
        self.float_attribute(it, "time")
    }

    /// Sets the simulation time of an iteration.
    pub fn set_time(&mut self, it: &Iteration, time: f64) -> StepfluxResult<()> {
        self.set_attribute(it.node(), "time", time)
    }

    /// Time step of an iteration.
    pub fn dt(&self, it: &Iteration) -> Option<f64> {
        self.float_attribute(it, "dt")
    }

    /// Sets the time step of an iteration.
    pub fn set_dt(&mut self, it: &Iteration, dt: f64) -> StepfluxResult<()> {
        self.set_attribute(it.node(), "dt", dt)
    }

    /// Conversion factor of `time` and `dt` to seconds.
    pub fn time_unit_si(&self, it: &Iteration) -> Option<f64> {
        self.float_attribute(it, "timeUnitSI")
    }

    /// Sets the conversion factor of `time` and `dt` to seconds.
    pub fn set_time_unit_si(&mut self, it: &Iteration, unit: f64) -> StepfluxResult<()> {
        self.set_attribute(it.node(), "timeUnitSI", unit)
    }

    fn float_attribute(&self, it: &Iteration, name: &str) -> Option<f64> {
        match self.tree.node(it.node()).ok()?.attribute(name)? {
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// True once the close marker of `it` has been committed to the backend.
    pub fn closed_by_writer(&self, it: &Iteration) -> bool {
        self.tree
            .node(it.node())
            .map(|n| n.attribute(CLOSED_MARKER).is_some() && !n.attribute_pending(CLOSED_MARKER))
            .unwrap_or(false)
    }

    /// Closes an iteration. With `flush`, its data is committed and its
    /// containers are closed (collectively, if configured) before returning.
    pub async fn close_iteration(&mut self, it: &Iteration, flush: bool) -> StepfluxResult<()> {
        it.cell().begin_close(it.index())?;
        self.tree.put_attribute(it.node(), CLOSED_MARKER, true.into())?;
        if flush {
            self.finalize(it.index(), it.node(), it.cell()).await?;
        }
        Ok(())
    }

    /// Flushes an iteration and releases its backend handles without finalizing it.
    pub async fn close_temporarily(&mut self, it: &Iteration) -> StepfluxResult<()> {
        if it.status() == CloseStatus::ClosedInBackend {
            return Err(StepfluxError::AlreadyClosed {
                index: it.index(),
                state: CloseStatus::ClosedInBackend.as_str(),
            });
        }
        self.flush_iteration(it.index(), it.node()).await.into_result()?;
        self.close_handles(it.node(), false).await?;
        self.close_file_root(it.index(), false, false).await?;
        it.cell().close_temporarily(it.index())?;
        debug!(index = it.index(), "iteration closed temporarily");
        Ok(())
    }

    /// Commits every pending change and finalizes iterations closed without flush.
    ///
    /// Finalizations take part in their barriers even when an earlier step of
    /// this call failed, and the first error is returned afterwards. An error
    /// leaves this rank's close states out of step with its peers: the caller
    /// must then retry `flush` on every rank or abort every rank before
    /// `close`.
    pub async fn flush(&mut self) -> StepfluxResult<FlushReport> {
        let mut report = FlushReport::default();
        match self.naming.encoding() {
            IterationEncoding::GroupBased => {
                let target = self.naming.resolve(0);
                let root = self.tree.root();
                report.absorb(
                    FlushScheduler::new(&*self.backend, &target)
                        .flush_subtree(&mut self.tree, root)
                        .await,
                );
            }
            IterationEncoding::FileBased => {
                let root = self.tree.root();
                let root_dirty = self.tree.node(root)?.is_dirty();
                for node in self.tree.iterations() {
                    let (index, cell) = self.tree.close_cell(node)?;
                    if cell.status() == CloseStatus::ClosedInBackend {
                        continue;
                    }
                    let root_open = self
                        .file_roots
                        .get(&index)
                        .map(|r| r.handle.is_some())
                        .unwrap_or(false);
                    if self.tree.is_dirty_recursive(node) || (root_dirty && root_open) {
                        report.absorb(self.flush_iteration(index, node).await);
                    }
                }
                if report.is_clean() {
                    let r = self.tree.node_mut(root)?;
                    r.pending_attributes.clear();
                    r.dirty = false;
                }
            }
        }
        // Every rank runs the same finalizations even after a local failure,
        // so the barriers inside `finalize` stay matched across ranks.
        let mut first_err = None;
        let mut report = match report.into_result() {
            Ok(report) => report,
            Err(e) => {
                first_err = Some(e);
                FlushReport::default()
            }
        };
        for node in self.tree.iterations() {
            let (index, cell) = self.tree.close_cell(node)?;
            if cell.needs_finalize() {
                match self.finalize(index, node, &cell).await {
                    Ok(r) => report.absorb(r),
                    Err(e) => {
                        warn!(index, error = %e, "iteration finalization failed");
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Ends the session: finalizes every iteration not yet closed in the
    /// backend and closes the run-wide root container. Calling it again is a no-op.
    ///
    /// Collective with more than one rank. An error on one rank is not
    /// propagated to the others; the caller must abort every rank.
    pub async fn close(&mut self) -> StepfluxResult<()> {
        if self.finished {
            return Ok(());
        }
        self.flush().await?;

        for node in self.tree.iterations() {
            let (index, cell) = self.tree.close_cell(node)?;
            if cell.status() == CloseStatus::ClosedInBackend {
                continue;
            }
            if !cell.closed() {
                cell.begin_close(index)?;
                self.tree.put_attribute(node, CLOSED_MARKER, true.into())?;
            }
            self.finalize(index, node, &cell).await?;
        }

        if self.naming.encoding() == IterationEncoding::GroupBased {
            let target = self.naming.resolve(0);
            let root = self.tree.root();
            FlushScheduler::new(&*self.backend, &target)
                .flush_subtree(&mut self.tree, root)
                .await
                .into_result()?;
            let collective = self.config.collective_close;
            if collective {
                self.comm.barrier().await;
            }
            if let Some(h) = self.tree.node(root)?.handle {
                self.backend.close_container(h, collective).await?;
                self.tree.node_mut(root)?.handle = None;
            }
        }

        self.finished = true;
        info!(rank = self.comm.rank(), series = %self.naming.template(), "series closed");
        Ok(())
    }

    /// Flushes one iteration subtree into its target, creating the path above it first.
    async fn flush_iteration(&mut self, index: u64, node: NodeId) -> FlushReport {
        let target = self.naming.resolve(index);
        match self.naming.encoding() {
            IterationEncoding::GroupBased => {
                FlushScheduler::new(&*self.backend, &target)
                    .flush_branch(&mut self.tree, node)
                    .await
            }
            IterationEncoding::FileBased => {
                if let Err(e) = self.sync_file_root(index, &target).await {
                    warn!(index, file = %target, error = %e, "file root flush failed");
                    return FlushReport {
                        nodes_skipped: self.tree.preorder(node).len() as u64,
                        failures: vec![FlushFailure {
                            path: String::from("/"),
                            reason: e.to_string(),
                        }],
                        ..FlushReport::default()
                    };
                }
                FlushScheduler::new(&*self.backend, &target)
                    .flush_subtree(&mut self.tree, node)
                    .await
            }
        }
    }

    /// Opens the root container of an iteration file and brings its copy of
    /// the series attributes up to date.
    async fn sync_file_root(&mut self, index: u64, target: &BackendTarget) -> StepfluxResult<()> {
        let attributes = self.tree.node(self.tree.root())?.attributes().clone();
        let entry = self.file_roots.entry(index).or_default();
        let handle = match entry.handle {
            Some(h) => h,
            None => {
                let h = self.backend.create_container(target, "/").await?;
                entry.handle = Some(h);
                h
            }
        };
        for (name, value) in attributes {
            if entry.sent.get(&name) == Some(&value) {
                continue;
            }
            self.backend.write_attribute(handle, &name, &value).await?;
            entry.sent.insert(name, value);
        }
        Ok(())
    }

    /// Flush, barrier, close containers, then mark the iteration closed in the backend.
    async fn finalize(&mut self, index: u64, node: NodeId, cell: &CloseCell) -> StepfluxResult<FlushReport> {
        let collective = self.config.collective_close;
        let report = self.flush_iteration(index, node).await;
        if collective {
            self.comm.barrier().await;
        }
        let report = report.into_result()?;

        self.close_handles(node, collective).await?;
        self.close_file_root(index, collective, true).await?;
        cell.finish_backend_close(index);
        Ok(report)
    }

    /// Closes every open container of a subtree, children first. A handle is
    /// dropped only after its close succeeded.
    async fn close_handles(&mut self, node: NodeId, collective: bool) -> StepfluxResult<()> {
        for id in self.tree.preorder(node).into_iter().rev() {
            let Some(handle) = self.tree.node(id)?.handle else {
                continue;
            };
            self.backend.close_container(handle, collective).await?;
            self.tree.node_mut(id)?.handle = None;
        }
        Ok(())
    }

    async fn close_file_root(&mut self, index: u64, collective: bool, last: bool) -> StepfluxResult<()> {
        if self.naming.encoding() != IterationEncoding::FileBased {
            return Ok(());
        }
        if let Some(root) = self.file_roots.get_mut(&index) {
            if let Some(h) = root.handle {
                self.backend.close_container(h, collective).await?;
                root.handle = None;
            }
        }
        if last {
            self.file_roots.remove(&index);
        }
        Ok(())
    }
}

impl<B: Backend, C: Communicator> Drop for Series<B, C> {
    fn drop(&mut self) {
        if !self.finished && self.tree.is_dirty_recursive(self.tree.root()) {
            warn!(
                rank = self.comm.rank(),
                series = %self.naming.template(),
                "series dropped with unflushed changes"
            );
        }
    }
}
