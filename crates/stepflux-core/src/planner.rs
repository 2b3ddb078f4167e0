//! Block distribution planning.
//!
//! Turns a step's global workload into the per-rank partition along the first
//! dimension, subdivides that partition into blocks, expands blocks into
//! second-dimension halves for 2-D meshes, and maps every mesh block onto a
//! contiguous range of the particle index space.

use serde::{Deserialize, Serialize};

/// Second-dimension size used for 2-D meshes unless configured otherwise.
pub const DEFAULT_SECOND_DIM: u64 = 128;

/// A contiguous `(offset, count)` range along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// First index of the range
    pub offset: u64,
    /// Number of indices in the range
    pub count: u64,
}

impl Span {
    /// Creates a span.
    pub fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    /// One past the last index.
    pub fn end(&self) -> u64 {
        self.offset + self.count
    }
}

/// The slice of the first dimension owned by one rank for one step.
pub type RankPartition = Span;

/// Which second-dimension half a 2-D block covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Half {
    /// Second-dimension range `[0, mid)`
    First,
    /// Second-dimension range `[mid, second_dim)`
    Second,
}

/// A 2-D block: one first-dimension span crossed with one second-dimension half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneBlock {
    /// Range along the first dimension
    pub first: Span,
    /// Range along the second dimension
    pub second: Span,
    /// Half of the second dimension this block covers
    pub half: Half,
}

/// A mesh block in dataset coordinates, ready for a chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshBlock {
    /// Offset per dimension
    pub offset: Vec<u64>,
    /// Extent per dimension
    pub extent: Vec<u64>,
}

impl MeshBlock {
    /// Number of mesh elements in the block.
    pub fn num_elements(&self) -> u64 {
        self.extent.iter().product()
    }
}

/// Computes the first-dimension partition of `rank` for `step`.
///
/// With imbalance enabled, at least two ranks, and `step % 3 == 1`, rank `10k`
/// hands its range to rank `10k + 1`. A rank `10k` without a partner keeps its
/// baseline range.
pub fn compute_rank_partition(
    global_first_dim: u64,
    world_size: u64,
    rank: u64,
    step: u64,
    bulk: u64,
    imbalance: bool,
) -> RankPartition {
    let mut part = Span::new(bulk * rank, bulk);

    if imbalance && world_size >= 2 && step % 3 == 1 {
        if rank % 10 == 0 && rank + 1 < world_size {
            part.count = 0;
        }

        if rank % 10 == 1 {
            part.offset -= bulk;
            part.count += bulk;
        }
    }

    debug_assert!(rank >= world_size || part.end() <= global_first_dim);
    part
}

/// Splits a rank partition into at most `requested` blocks of near-equal size.
pub fn subdivide(rank_offset: u64, rank_count: u64, requested: u32) -> Vec<Span> {
    if rank_count == 0 {
        return Vec::new();
    }

    let mut n = u64::from(requested.max(1));
    if rank_count / n <= 1 {
        n = 1;
    }

    let size = rank_count / n;
    let mut blocks = Vec::with_capacity(n as usize);
    let mut counter = 0u64;
    for i in 0..n {
        let count = if i == n - 1 {
            rank_count - size * (n - 1)
        } else {
            size
        };
        blocks.push(Span::new(rank_offset + counter, count));
        counter += count;
    }
    blocks
}

/// Splits `second_dim` into the `(mid, rest)` halves.
pub fn halves(second_dim: u64) -> (u64, u64) {
    let mid = second_dim / 2;
    (mid, second_dim - mid)
}

/// Expands 1-D blocks into second-dimension halves.
///
/// All first halves come first, in input order, then all second halves.
pub fn expand_to_second_dimension(blocks: &[Span], second_dim: u64) -> Vec<PlaneBlock> {
    let (mid, rest) = halves(second_dim);
    let first = blocks.iter().map(|b| PlaneBlock {
        first: *b,
        second: Span::new(0, mid),
        half: Half::First,
    });
    let second = blocks.iter().map(|b| PlaneBlock {
        first: *b,
        second: Span::new(mid, rest),
        half: Half::Second,
    });
    first.chain(second).collect()
}

/// Particle range of a 1-D mesh block.
pub fn particle_range_1d(block: Span, ratio: u64) -> Span {
    Span::new(block.offset * ratio, block.count * ratio)
}

/// Particle range of a 2-D mesh block within its rank's partition.
///
/// Ranks are laid out in order; inside a rank the first halves precede the
/// second halves, and blocks keep their mesh order inside each half.
pub fn particle_range_2d(partition: RankPartition, block: &PlaneBlock, second_dim: u64, ratio: u64) -> Span {
    let (mid, rest) = halves(second_dim);
    let base = partition.offset * second_dim * ratio;
    let local = block.first.offset - partition.offset;
    match block.half {
        Half::First => Span::new(base + local * mid * ratio, block.first.count * mid * ratio),
        Half::Second => Span::new(
            base + partition.count * mid * ratio + local * rest * ratio,
            block.first.count * rest * ratio,
        ),
    }
}

/// Workload parameters shared by all ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanParams {
    /// Elements per rank along the first dimension
    pub bulk: u64,
    /// Requested blocks per rank
    pub segments: u32,
    /// Particles per mesh element
    pub ratio: u64,
    /// Inject load imbalance on every third step
    pub imbalance: bool,
    /// Second-dimension size of 2-D meshes
    pub second_dim: u64,
}

impl Default for PlanParams {
    fn default() -> Self {
        Self {
            bulk: 1000,
            segments: 1,
            ratio: 1,
            imbalance: false,
            second_dim: DEFAULT_SECOND_DIM,
        }
    }
}

impl PlanParams {
    /// Segment count to use; collective write mode only supports one block per rank.
    pub fn effective_segments(&self, collective_writes: bool) -> u32 {
        if collective_writes {
            1
        } else {
            self.segments
        }
    }
}

/// The complete block layout of one rank for one step.
#[derive(Debug, Clone)]
pub struct StepPlan {
    params: PlanParams,
    global_extent: Vec<u64>,
    partition: RankPartition,
    spans: Vec<Span>,
    planes: Vec<PlaneBlock>,
}

impl StepPlan {
    /// Plans `rank`'s blocks for `step` of a `dims`-dimensional mesh (1 or 2).
    pub fn new(params: PlanParams, world_size: u64, rank: u64, step: u64, dims: usize) -> Self {
        let first_dim = params.bulk * world_size;
        let global_extent = if dims >= 2 {
            vec![first_dim, params.second_dim]
        } else {
            vec![first_dim]
        };

        let partition =
            compute_rank_partition(first_dim, world_size, rank, step, params.bulk, params.imbalance);
        let spans = subdivide(partition.offset, partition.count, params.segments);
        let planes = if dims >= 2 {
            expand_to_second_dimension(&spans, params.second_dim)
        } else {
            Vec::new()
        };

        tracing::debug!(
            rank,
            step,
            dims,
            offset = partition.offset,
            count = partition.count,
            blocks = spans.len(),
            "planned step"
        );

        Self {
            params,
            global_extent,
            partition,
            spans,
            planes,
        }
    }

    /// Global mesh extent for the step.
    pub fn global_extent(&self) -> &[u64] {
        &self.global_extent
    }

    /// This rank's first-dimension partition.
    pub fn partition(&self) -> RankPartition {
        self.partition
    }

    /// Number of mesh dimensions.
    pub fn dims(&self) -> usize {
        self.global_extent.len()
    }

    /// Number of mesh blocks this rank writes.
    pub fn num_blocks(&self) -> usize {
        if self.dims() == 1 {
            self.spans.len()
        } else {
            self.planes.len()
        }
    }

    /// The `n`th mesh block, or `None` past the end.
    pub fn mesh_block(&self, n: usize) -> Option<MeshBlock> {
        if self.dims() == 1 {
            let s = self.spans.get(n)?;
            Some(MeshBlock {
                offset: vec![s.offset],
                extent: vec![s.count],
            })
        } else {
            let p = self.planes.get(n)?;
            Some(MeshBlock {
                offset: vec![p.first.offset, p.second.offset],
                extent: vec![p.first.count, p.second.count],
            })
        }
    }

    /// Particle range belonging to the `n`th mesh block.
    pub fn particle_range(&self, n: usize) -> Option<Span> {
        if self.dims() == 1 {
            self.spans.get(n).map(|s| particle_range_1d(*s, self.params.ratio))
        } else {
            self.planes
                .get(n)
                .map(|p| particle_range_2d(self.partition, p, self.params.second_dim, self.params.ratio))
        }
    }

    /// Total particle count across all ranks.
    pub fn total_particles(&self) -> u64 {
        self.global_extent.iter().product::<u64>() * self.params.ratio
    }
}
