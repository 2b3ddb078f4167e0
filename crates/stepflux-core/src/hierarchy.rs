//! Record hierarchy with deferred writes and dirty tracking.
//!
//! Nodes live in an arena owned by the [`Hierarchy`]; a node owns its children
//! through their indices and refers to its parent by index only. Mutations
//! never touch the backend: they fill per-node queues and mark the node and its
//! ancestors dirty until a flush drains them.

use std::collections::{BTreeMap, VecDeque};

use crate::backend::BackendHandle;
use crate::datatype::{AttributeValue, ChunkBuffer, Dataset};
use crate::error::{StepfluxError, StepfluxResult};
use crate::iteration::CloseCell;

/// Component name of a scalar record; the component shares its record's path.
pub const SCALAR: &str = "\u{b}Scalar";

/// Names a node may not take: they are the keys of a stored container.
pub const RESERVED_NAMES: [&str; 4] = ["attributes", "data", "datatype", "extent"];

/// Stable arena index of a hierarchy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Role of a node in the record tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Session root
    Series,
    /// One time step
    Iteration,
    /// Container of meshes inside an iteration
    Meshes,
    /// Container of particle species inside an iteration
    Particles,
    /// A mesh record
    Mesh,
    /// A particle species
    Species,
    /// A particle record
    Record,
    /// A dataset-carrying leaf
    Component,
}

/// A chunk write waiting for the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    /// Payload
    pub data: ChunkBuffer,
    /// Offset per dimension
    pub offset: Vec<u64>,
    /// Extent per dimension
    pub extent: Vec<u64>,
}

/// Dataset bookkeeping of a record component.
#[derive(Debug, Default)]
pub(crate) struct ComponentState {
    pub(crate) dataset: Option<Dataset>,
    pub(crate) dataset_written: bool,
    pub(crate) constant: bool,
    pub(crate) chunks: VecDeque<PendingChunk>,
}

/// One writable node.
#[derive(Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) dirty: bool,
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
    pub(crate) pending_attributes: VecDeque<String>,
    pub(crate) handle: Option<BackendHandle>,
    pub(crate) component: Option<ComponentState>,
    pub(crate) close: Option<(u64, CloseCell)>,
}

impl Node {
    fn new(name: String, kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            name,
            kind,
            parent,
            children: Vec::new(),
            dirty: true,
            attributes: BTreeMap::new(),
            pending_attributes: VecDeque::new(),
            handle: None,
            component: (kind == NodeKind::Component).then(ComponentState::default),
            close: None,
        }
    }

    /// Node name relative to its parent.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node role.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Parent node, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in creation order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Own dirty flag (descendants not considered).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Attribute value by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// All attributes.
    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// True when `name` has been set but not yet committed.
    pub fn attribute_pending(&self, name: &str) -> bool {
        self.pending_attributes.iter().any(|n| n == name)
    }

    /// Declared dataset of a component.
    pub fn dataset(&self) -> Option<&Dataset> {
        self.component.as_ref().and_then(|c| c.dataset.as_ref())
    }

    /// Number of queued chunk writes.
    pub fn pending_chunks(&self) -> usize {
        self.component.as_ref().map(|c| c.chunks.len()).unwrap_or(0)
    }

    /// Has the backend container been created?
    pub fn in_backend(&self) -> bool {
        self.handle.is_some()
    }
}

/// Arena of writable nodes rooted at the Series node.
#[derive(Debug)]
pub struct Hierarchy {
    nodes: Vec<Node>,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl Hierarchy {
    /// Creates a hierarchy holding only the root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(String::new(), NodeKind::Series, None)],
        }
    }

    /// The Series root.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; the root exists from the start.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrows a node.
    pub fn node(&self, id: NodeId) -> StepfluxResult<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| StepfluxError::NodeNotFound(format!("#{}", id.0)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> StepfluxResult<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| StepfluxError::NodeNotFound(format!("#{}", id.0)))
    }

    /// Absolute path of a node, `/` for the root.
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.nodes.get(c.0) {
                Some(n) => {
                    if !n.name.is_empty() && n.name != SCALAR {
                        parts.push(n.name.as_str());
                    }
                    cur = n.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Looks up a child by name.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let p = self.nodes.get(parent.0)?;
        p.children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].name == name)
    }

    /// Returns the named child, creating it if it does not exist yet.
    pub fn get_or_create(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> StepfluxResult<(NodeId, bool)> {
        if let Some(id) = self.child(parent, name) {
            return Ok((id, false));
        }
        self.node(parent)?;
        if RESERVED_NAMES.contains(&name) {
            return Err(StepfluxError::ReservedName {
                parent: self.path(parent),
                name: name.to_string(),
            });
        }
        self.check_writable(parent)?;
        self.reopen(parent);

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name.to_string(), kind, Some(parent)));
        self.node_mut(parent)?.children.push(id);
        self.mark_dirty(id);
        tracing::debug!(path = %self.path(id), ?kind, "created node");
        Ok((id, true))
    }

    /// Returns the iteration node for `index`, creating it with a fresh close cell.
    pub fn get_or_create_iteration(&mut self, index: u64) -> StepfluxResult<(NodeId, bool)> {
        let root = self.root();
        let name = format!("data/{}", index);
        let (id, created) = self.get_or_create(root, &name, NodeKind::Iteration)?;
        if created {
            self.node_mut(id)?.close = Some((index, CloseCell::new()));
        }
        Ok((id, created))
    }

    /// Close cell of an iteration node.
    pub fn close_cell(&self, id: NodeId) -> StepfluxResult<(u64, CloseCell)> {
        self.node(id)?
            .close
            .clone()
            .ok_or_else(|| StepfluxError::NodeNotFound(format!("{} is not an iteration", self.path(id))))
    }

    /// The iteration node that owns `id`, if any.
    pub fn iteration_of(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = self.nodes.get(c.0)?;
            if n.kind == NodeKind::Iteration {
                return Some(c);
            }
            cur = n.parent;
        }
        None
    }

    fn check_writable(&self, id: NodeId) -> StepfluxResult<()> {
        if let Some(it) = self.iteration_of(id) {
            if let Some((index, cell)) = &self.nodes[it.0].close {
                cell.check_writable(*index)?;
            }
        }
        Ok(())
    }

    /// Reopens a temporarily closed owning iteration; called once a mutation passed validation.
    fn reopen(&self, id: NodeId) {
        if let Some(it) = self.iteration_of(id) {
            if let Some((index, cell)) = &self.nodes[it.0].close {
                cell.reopen(*index);
            }
        }
    }

    /// Marks `id` and every ancestor dirty.
    pub fn mark_dirty(&mut self, id: NodeId) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.nodes.get_mut(c.0) {
                Some(n) => {
                    n.dirty = true;
                    cur = n.parent;
                }
                None => break,
            }
        }
    }

    /// True iff `id` or any descendant has uncommitted changes.
    pub fn is_dirty_recursive(&self, id: NodeId) -> bool {
        let Some(n) = self.nodes.get(id.0) else {
            return false;
        };
        n.dirty || n.children.iter().any(|c| self.is_dirty_recursive(*c))
    }

    /// Sets an attribute and queues it for the next flush.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: AttributeValue) -> StepfluxResult<()> {
        self.check_writable(id)?;
        self.node(id)?;
        self.reopen(id);
        self.put_attribute(id, name, value)
    }

    /// Sets an attribute without the closed-iteration check.
    pub(crate) fn put_attribute(&mut self, id: NodeId, name: &str, value: AttributeValue) -> StepfluxResult<()> {
        let node = self.node_mut(id)?;
        node.attributes.insert(name.to_string(), value);
        if !node.pending_attributes.iter().any(|n| n == name) {
            node.pending_attributes.push_back(name.to_string());
        }
        self.mark_dirty(id);
        Ok(())
    }

    fn component_path_check(&self, id: NodeId) -> StepfluxResult<&ComponentState> {
        self.node(id)?
            .component
            .as_ref()
            .ok_or_else(|| StepfluxError::NodeNotFound(format!("{} is not a record component", self.path(id))))
    }

    /// Declares or re-declares the dataset of a component.
    pub fn declare_dataset(&mut self, id: NodeId, dataset: Dataset) -> StepfluxResult<()> {
        self.check_writable(id)?;
        let path = self.path(id);
        let comp = self.component_path_check(id)?;

        if let Some(old) = &comp.dataset {
            if *old == dataset {
                return Ok(());
            }
            if comp.dataset_written {
                return Err(StepfluxError::ShapeRedefinition {
                    path,
                    old: old.extent.clone(),
                    new: dataset.extent,
                });
            }
        }
        for chunk in &comp.chunks {
            check_chunk_fits(&path, &dataset, &chunk.offset, &chunk.extent)?;
            if chunk.data.datatype() != dataset.datatype {
                return Err(StepfluxError::DatatypeMismatch {
                    path,
                    expected: dataset.datatype,
                    actual: chunk.data.datatype(),
                });
            }
        }

        let constant = comp.constant;
        let shape = dataset.extent.clone();
        self.reopen(id);
        if let Some(c) = self.node_mut(id)?.component.as_mut() {
            c.dataset = Some(dataset);
        }
        if constant {
            self.put_attribute(id, "shape", AttributeValue::UIntVec(shape))?;
        }
        self.mark_dirty(id);
        Ok(())
    }

    /// Queues a chunk write. Zero-extent chunks are skipped.
    pub fn store_chunk(&mut self, id: NodeId, data: ChunkBuffer, offset: Vec<u64>, extent: Vec<u64>) -> StepfluxResult<()> {
        self.check_writable(id)?;
        let path = self.path(id);
        let comp = self.component_path_check(id)?;

        if extent.iter().any(|e| *e == 0) {
            tracing::trace!(%path, "skipping zero-extent chunk");
            return Ok(());
        }
        if comp.constant {
            return Err(StepfluxError::ConstantComponent { path });
        }
        let dataset = comp
            .dataset
            .as_ref()
            .ok_or_else(|| StepfluxError::NoDataset { path: path.clone() })?;
        if data.datatype() != dataset.datatype {
            return Err(StepfluxError::DatatypeMismatch {
                path,
                expected: dataset.datatype,
                actual: data.datatype(),
            });
        }
        check_chunk_fits(&path, dataset, &offset, &extent)?;
        let expected: u64 = extent.iter().product();
        if data.len() != expected {
            return Err(StepfluxError::BufferSizeMismatch {
                path,
                expected,
                actual: data.len(),
            });
        }

        self.reopen(id);
        if let Some(c) = self.node_mut(id)?.component.as_mut() {
            c.chunks.push_back(PendingChunk { data, offset, extent });
        }
        self.mark_dirty(id);
        Ok(())
    }

    /// Turns a component into a constant: a single value over the declared shape.
    pub fn make_constant(&mut self, id: NodeId, value: AttributeValue) -> StepfluxResult<()> {
        self.check_writable(id)?;
        let path = self.path(id);
        let comp = self.component_path_check(id)?;
        let dataset = comp
            .dataset
            .as_ref()
            .ok_or_else(|| StepfluxError::NoDataset { path: path.clone() })?;
        if !comp.chunks.is_empty() || (comp.dataset_written && !comp.constant) {
            return Err(StepfluxError::ConstantComponent { path });
        }
        let shape = dataset.extent.clone();

        self.reopen(id);
        if let Some(c) = self.node_mut(id)?.component.as_mut() {
            c.constant = true;
        }
        self.put_attribute(id, "value", value)?;
        self.put_attribute(id, "shape", AttributeValue::UIntVec(shape))
    }

    /// Nodes of the subtree rooted at `id`, parents before children.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(c) = stack.pop() {
            let Some(n) = self.nodes.get(c.0) else {
                continue;
            };
            out.push(c);
            stack.extend(n.children.iter().rev().copied());
        }
        out
    }

    /// Iteration nodes in creation order.
    pub fn iterations(&self) -> Vec<NodeId> {
        self.nodes[0]
            .children
            .iter()
            .copied()
            .filter(|c| self.nodes[c.0].kind == NodeKind::Iteration)
            .collect()
    }
}

fn check_chunk_fits(path: &str, dataset: &Dataset, offset: &[u64], extent: &[u64]) -> StepfluxResult<()> {
    let rank = dataset.extent.len();
    let fits = offset.len() == rank
        && extent.len() == rank
        && offset
            .iter()
            .zip(extent)
            .zip(&dataset.extent)
            .all(|((o, e), s)| o.checked_add(*e).map(|end| end <= *s).unwrap_or(false));
    if fits {
        Ok(())
    } else {
        Err(StepfluxError::ShapeMismatch {
            path: path.to_string(),
            offset: offset.to_vec(),
            extent: extent.to_vec(),
            shape: dataset.extent.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use crate::iteration::CloseStatus;

    fn component_tree() -> (Hierarchy, NodeId, NodeId) {
        let mut h = Hierarchy::new();
        let (it, _) = h.get_or_create_iteration(1).unwrap();
        let (meshes, _) = h.get_or_create(it, "fields", NodeKind::Meshes).unwrap();
        let (mesh, _) = h.get_or_create(meshes, "E", NodeKind::Mesh).unwrap();
        let (comp, _) = h.get_or_create(mesh, "alpha", NodeKind::Component).unwrap();
        (h, it, comp)
    }

    fn clear_all(h: &mut Hierarchy) {
        for n in h.nodes.iter_mut() {
            n.dirty = false;
        }
    }

    #[test]
    fn test_paths() {
        let (h, it, comp) = component_tree();
        assert_eq!(h.path(h.root()), "/");
        assert_eq!(h.path(it), "/data/1");
        assert_eq!(h.path(comp), "/data/1/fields/E/alpha");
    }

    #[test]
    fn test_scalar_component_shares_record_path() {
        let (mut h, it, _) = component_tree();
        let meshes = h.child(it, "fields").unwrap();
        let (rho, _) = h.get_or_create(meshes, "rho", NodeKind::Mesh).unwrap();
        let (scalar, _) = h.get_or_create(rho, SCALAR, NodeKind::Component).unwrap();
        assert_eq!(h.path(scalar), "/data/1/fields/rho");
        assert_eq!(h.node(scalar).unwrap().name(), SCALAR);
    }

    #[test]
    fn test_reserved_names_rejected() {
        let (mut h, it, comp) = component_tree();
        let mesh = h.node(comp).unwrap().parent().unwrap();
        let before = h.len();
        for name in RESERVED_NAMES {
            assert!(matches!(
                h.get_or_create(mesh, name, NodeKind::Component),
                Err(StepfluxError::ReservedName { .. })
            ));
        }
        assert!(matches!(
            h.get_or_create(it, "attributes", NodeKind::Meshes),
            Err(StepfluxError::ReservedName { .. })
        ));
        assert_eq!(h.len(), before);
        // iteration groups live below a `data/<index>` name, which is not reserved
        assert!(h.get_or_create_iteration(2).is_ok());
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (mut h, it, _) = component_tree();
        let before = h.len();
        let (meshes, created) = h.get_or_create(it, "fields", NodeKind::Meshes).unwrap();
        assert!(!created);
        assert_eq!(h.node(meshes).unwrap().kind(), NodeKind::Meshes);
        assert_eq!(h.len(), before);
    }

    #[test]
    fn test_set_attribute_marks_ancestors_dirty() {
        let (mut h, it, comp) = component_tree();
        clear_all(&mut h);
        assert!(!h.is_dirty_recursive(h.root()));

        h.set_attribute(comp, "unitSI", 1.0.into()).unwrap();
        assert!(h.node(comp).unwrap().is_dirty());
        assert!(h.node(it).unwrap().is_dirty());
        assert!(h.node(h.root()).unwrap().is_dirty());
        assert!(h.node(comp).unwrap().attribute_pending("unitSI"));
    }

    #[test]
    fn test_repeated_attribute_queued_once() {
        let (mut h, _, comp) = component_tree();
        h.set_attribute(comp, "unitSI", 1.0.into()).unwrap();
        h.set_attribute(comp, "unitSI", 2.0.into()).unwrap();
        let n = h.node(comp).unwrap();
        assert_eq!(n.pending_attributes.len(), 1);
        assert_eq!(n.attribute("unitSI"), Some(&AttributeValue::Float(2.0)));
    }

    #[test]
    fn test_dirty_recursive_sees_descendants() {
        let (mut h, it, comp) = component_tree();
        clear_all(&mut h);
        h.nodes[comp.0].dirty = true;
        assert!(h.is_dirty_recursive(it));
        assert!(!h.node(it).unwrap().is_dirty());
    }

    #[test]
    fn test_store_chunk_requires_dataset() {
        let (mut h, _, comp) = component_tree();
        let err = h
            .store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![0], vec![4])
            .unwrap_err();
        assert!(matches!(err, StepfluxError::NoDataset { .. }));
    }

    #[test]
    fn test_store_chunk_shape_mismatch_leaves_state() {
        let (mut h, _, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10])).unwrap();
        clear_all(&mut h);

        let err = h
            .store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![8], vec![4])
            .unwrap_err();
        assert!(matches!(err, StepfluxError::ShapeMismatch { .. }));
        assert_eq!(h.node(comp).unwrap().pending_chunks(), 0);
        assert!(!h.is_dirty_recursive(h.root()));
    }

    #[test]
    fn test_store_chunk_rank_mismatch() {
        let (mut h, _, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10, 4])).unwrap();
        let err = h
            .store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![0], vec![4])
            .unwrap_err();
        assert!(matches!(err, StepfluxError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_store_chunk_datatype_and_size_checks() {
        let (mut h, _, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10])).unwrap();
        assert!(matches!(
            h.store_chunk(comp, ChunkBuffer::from(vec![1u64; 4]), vec![0], vec![4]),
            Err(StepfluxError::DatatypeMismatch { .. })
        ));
        assert!(matches!(
            h.store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 3]), vec![0], vec![4]),
            Err(StepfluxError::BufferSizeMismatch { expected: 4, actual: 3, .. })
        ));
    }

    #[test]
    fn test_store_chunk_queues_fifo() {
        let (mut h, _, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10])).unwrap();
        h.store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![0], vec![4]).unwrap();
        h.store_chunk(comp, ChunkBuffer::from(vec![2.0f64; 6]), vec![4], vec![6]).unwrap();
        let c = h.node(comp).unwrap().component.as_ref().unwrap();
        assert_eq!(c.chunks.len(), 2);
        assert_eq!(c.chunks[0].offset, vec![0]);
        assert_eq!(c.chunks[1].offset, vec![4]);
    }

    #[test]
    fn test_zero_extent_chunk_skipped() {
        let (mut h, _, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10])).unwrap();
        clear_all(&mut h);
        h.store_chunk(comp, ChunkBuffer::from_slice::<f64>(&[]), vec![0], vec![0]).unwrap();
        assert_eq!(h.node(comp).unwrap().pending_chunks(), 0);
        assert!(!h.is_dirty_recursive(h.root()));
    }

    #[test]
    fn test_declare_dataset_idempotent_and_redefinition() {
        let (mut h, _, comp) = component_tree();
        let ds = Dataset::new(Datatype::Float64, vec![10]);
        h.declare_dataset(comp, ds.clone()).unwrap();
        h.declare_dataset(comp, ds.clone()).unwrap();

        // unflushed: a different shape replaces the old one
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![20])).unwrap();
        assert_eq!(h.node(comp).unwrap().dataset().unwrap().extent, vec![20]);

        h.nodes[comp.0].component.as_mut().unwrap().dataset_written = true;
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![20])).unwrap();
        let err = h
            .declare_dataset(comp, Dataset::new(Datatype::Float64, vec![30]))
            .unwrap_err();
        assert!(matches!(err, StepfluxError::ShapeRedefinition { .. }));
    }

    #[test]
    fn test_redeclare_must_keep_queued_chunks_valid() {
        let (mut h, _, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10])).unwrap();
        h.store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![6], vec![4]).unwrap();
        let err = h
            .declare_dataset(comp, Dataset::new(Datatype::Float64, vec![8]))
            .unwrap_err();
        assert!(matches!(err, StepfluxError::ShapeMismatch { .. }));
        assert_eq!(h.node(comp).unwrap().dataset().unwrap().extent, vec![10]);
    }

    #[test]
    fn test_make_constant() {
        let (mut h, _, comp) = component_tree();
        assert!(h.make_constant(comp, 0.0.into()).is_err());
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![10])).unwrap();
        h.make_constant(comp, 0.0.into()).unwrap();
        let n = h.node(comp).unwrap();
        assert_eq!(n.attribute("value"), Some(&AttributeValue::Float(0.0)));
        assert_eq!(n.attribute("shape"), Some(&AttributeValue::UIntVec(vec![10])));
        assert!(matches!(
            h.store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![0], vec![4]),
            Err(StepfluxError::ConstantComponent { .. })
        ));
    }

    #[test]
    fn test_closed_iteration_rejects_mutation_and_creation() {
        let (mut h, it, comp) = component_tree();
        let (index, cell) = h.close_cell(it).unwrap();
        cell.begin_close(index).unwrap();

        assert!(matches!(
            h.set_attribute(comp, "unitSI", 1.0.into()),
            Err(StepfluxError::IterationClosed { index: 1 })
        ));
        assert!(matches!(
            h.get_or_create(it, "particles", NodeKind::Particles),
            Err(StepfluxError::IterationClosed { .. })
        ));
        // existing nodes still resolve
        assert!(h.get_or_create(it, "fields", NodeKind::Meshes).is_ok());
        // the root is outside any iteration
        assert!(h.set_attribute(h.root(), "author", "x".into()).is_ok());
    }

    #[test]
    fn test_rejected_write_keeps_temporary_close() {
        let (mut h, it, comp) = component_tree();
        h.declare_dataset(comp, Dataset::new(Datatype::Float64, vec![4])).unwrap();
        let (index, cell) = h.close_cell(it).unwrap();
        cell.close_temporarily(index).unwrap();

        let err = h
            .store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![2], vec![4])
            .unwrap_err();
        assert!(matches!(err, StepfluxError::ShapeMismatch { .. }));
        assert_eq!(cell.status(), CloseStatus::ClosedTemporarily);

        h.store_chunk(comp, ChunkBuffer::from(vec![1.0f64; 4]), vec![0], vec![4]).unwrap();
        assert_eq!(cell.status(), CloseStatus::Open);
    }

    #[test]
    fn test_preorder_parents_first() {
        let (h, it, comp) = component_tree();
        let order = h.preorder(h.root());
        let pos = |id: NodeId| order.iter().position(|x| *x == id).unwrap();
        assert_eq!(order[0], h.root());
        assert!(pos(it) < pos(comp));
        assert_eq!(order.len(), h.len());
    }

    #[test]
    fn test_iterations_listing() {
        let (mut h, it, _) = component_tree();
        let (it2, _) = h.get_or_create_iteration(2).unwrap();
        assert_eq!(h.iterations(), vec![it, it2]);
        assert_eq!(h.iteration_of(it2), Some(it2));
        assert_eq!(h.iteration_of(h.root()), None);
    }
}
