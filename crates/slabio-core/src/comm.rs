//! Transport abstraction.
//!
//! The library never talks to a message-passing runtime directly; it goes
//! through the [`Comm`] trait, which captures exactly the collectives the
//! pipeline needs. Two implementations ship here: the in-process threaded
//! transport ([`threaded::ThreadComm`]) where N ranks are N threads of one
//! process, and (behind the `mpi` cargo feature) an adapter over a real
//! MPI communicator.

use std::sync::Arc;

use crate::error::Result;

pub mod threaded;

#[cfg(feature = "mpi")]
pub mod mpi;

/// Reduction operator for [`Comm::all_reduce_i64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub(crate) fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

/// The collectives required by the pipeline.
///
/// All byte-level operations use contiguous, rank-ordered blocks with
/// prefix-sum displacements; element sizes are folded into the counts by
/// the caller, so one implementation serves every scalar type.
///
/// Every method is collective: all ranks of the communicator must make
/// the same call in the same order.
pub trait Comm: Send + Sync {
    fn rank(&self) -> i32;

    fn size(&self) -> i32;

    /// Duplicate the communicator; the clone has the same ranks but an
    /// independent collective schedule.
    fn duplicate(&self) -> Result<Arc<dyn Comm>>;

    /// Colour split. Ranks passing the same `color` land in one new
    /// communicator, ordered by `key` (ties broken by old rank).
    fn split(&self, color: i32, key: i32) -> Result<Arc<dyn Comm>>;

    /// All-reduce one `i64` per rank.
    fn all_reduce_i64(&self, value: i64, op: ReduceOp) -> Result<i64>;

    /// Broadcast `buf` from `root`. Every rank must pass a buffer of the
    /// same length.
    fn broadcast(&self, root: i32, buf: &mut [u8]) -> Result<()>;

    /// Gather one `i64` per rank to `root`. The root receives the values
    /// in rank order; other ranks receive an empty vec.
    fn gather_i64(&self, root: i32, value: i64) -> Result<Vec<i64>>;

    /// Gather variable-length byte blocks to `root`. `recv_counts` and
    /// `recv` are only read on the root, where incoming blocks are packed
    /// contiguously in rank order.
    fn gather_v(
        &self,
        root: i32,
        send: &[u8],
        recv_counts: &[usize],
        recv: &mut [u8],
    ) -> Result<()>;

    /// Scatter contiguous rank-ordered byte blocks from `root`. `send`
    /// and `send_counts` are only read on the root.
    fn scatter_v(
        &self,
        root: i32,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
    ) -> Result<()>;

    /// Variable all-to-all. `send` holds one block per destination rank
    /// (sizes in `send_counts`, bytes); `recv` receives one block per
    /// source rank (sizes in `recv_counts`).
    fn all_to_all_v(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<()>;
}
