//! Decomposition: the immutable plan mapping compute-rank elements onto
//! contiguous I/O-rank slabs.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::comm::{Comm, ReduceOp};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::transfer::alloc_buf;

/// Exchange partner: a peer rank and the local element offsets moved to
/// or from it, in transfer order.
pub(crate) struct Peer {
    pub rank: i32,
    pub offsets: Vec<u64>,
}

/// One side of the exchange tables. `total` is the number of local
/// elements covered by all peers together.
pub(crate) struct ExchangeList {
    pub peers: Vec<Peer>,
    pub total: usize,
}

/// Intra-group aggregation plan: compute elements are funnelled onto the
/// sub-group leader (rank 0 of `comm`) before the compute/I-O exchange,
/// cutting the peer count of the all-to-all by the aggregation factor.
pub struct AggPlan {
    comm: Arc<dyn Comm>,
    n_compute_agg: usize,
    counts: Vec<usize>,
    displs: Vec<usize>,
}

/// Aggregation mode of a decomposition.
pub enum Aggregation {
    Disabled,
    Grouped(AggPlan),
}

/// Immutable description of one element layout.
///
/// `comp_list`/`io_list` drive [`transfer_field`](crate::transfer_field)
/// in either direction for any element size; `io_start`/`io_count` are
/// this rank's contiguous range of the global element list (count 0 on
/// non-I/O ranks).
pub struct Decomp {
    comm: Arc<dyn Comm>,
    n_compute: usize,
    io_start: u64,
    io_count: u64,
    pub(crate) comp_list: ExchangeList,
    pub(crate) io_list: ExchangeList,
    agg: Aggregation,
}

/// Contiguous range of `[0, n_global)` owned by I/O task `task` when the
/// list is partitioned into `n_io_tasks` nearly-equal blocks.
pub(crate) fn io_range(n_global: u64, n_io_tasks: i32, task: i32) -> (u64, u64) {
    let k = n_io_tasks as u64;
    let t = task as u64;
    let base = n_global / k;
    let rem = n_global % k;
    if t < rem {
        (t * (base + 1), base + 1)
    } else {
        (rem * (base + 1) + (t - rem) * base, base)
    }
}

/// The I/O task whose range contains `elem`. Inverse of [`io_range`].
pub(crate) fn owner_of(n_global: u64, n_io_tasks: i32, elem: u64) -> i32 {
    let k = n_io_tasks as u64;
    let base = n_global / k;
    let rem = n_global % k;
    let boundary = rem * (base + 1);
    if elem < boundary {
        (elem / (base + 1)) as i32
    } else {
        (rem + (elem - boundary) / base) as i32
    }
}

impl Context {
    /// Build a decomposition for the element layout where this rank owns
    /// `compute_elements` (global indices, each held by exactly one
    /// rank). Collective over the parent communicator.
    pub fn create_decomp(self: &Arc<Context>, compute_elements: &[u64]) -> Result<Decomp> {
        Decomp::new(self, compute_elements)
    }
}

impl Decomp {
    fn new(ctx: &Arc<Context>, compute_elements: &[u64]) -> Result<Decomp> {
        let comm = Arc::clone(ctx.comm());
        let n_compute = compute_elements.len();
        let rank = ctx.rank();
        let n_io_tasks = ctx.num_io_tasks();
        let stride = ctx.io_stride();

        let n_global = comm.all_reduce_i64(n_compute as i64, ReduceOp::Sum)? as u64;
        if n_global == 0 {
            return Err(Error::InvalidArgument("decomposition has no elements"));
        }

        let (io_start, io_count) = if ctx.is_io_task() && rank / stride < n_io_tasks {
            io_range(n_global, n_io_tasks, rank / stride)
        } else {
            (0, 0)
        };

        // Aggregation funnels each sub-group's element list onto its
        // leader; the exchange below then runs over the leaders' lists.
        let factor = ctx.config().agg_factor;
        let (agg, effective): (Aggregation, Cow<'_, [u64]>) = if factor >= 2 {
            let agg_comm = comm.split(rank / factor, rank)?;
            let counts: Vec<usize> = agg_comm
                .gather_i64(0, n_compute as i64)?
                .into_iter()
                .map(|c| c as usize)
                .collect();
            let mut displs = Vec::with_capacity(counts.len());
            let mut off = 0usize;
            for &c in &counts {
                displs.push(off);
                off += c;
            }
            let n_compute_agg = off;

            let mut send = Vec::with_capacity(n_compute * 8);
            for &e in compute_elements {
                send.extend_from_slice(&e.to_le_bytes());
            }
            let byte_counts: Vec<usize> = counts.iter().map(|c| c * 8).collect();
            let mut recv = alloc_buf(n_compute_agg * 8)?;
            agg_comm.gather_v(0, &send, &byte_counts, &mut recv)?;
            let ids: Vec<u64> = recv
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect();

            let plan = AggPlan {
                comm: agg_comm,
                n_compute_agg,
                counts,
                displs,
            };
            (Aggregation::Grouped(plan), Cow::Owned(ids))
        } else {
            (Aggregation::Disabled, Cow::Borrowed(compute_elements))
        };

        let (comp_list, io_list) = build_exchange(
            &comm, &effective, n_global, n_io_tasks, stride, io_start, io_count,
        )?;

        Ok(Decomp {
            comm,
            n_compute,
            io_start,
            io_count,
            comp_list,
            io_list,
            agg,
        })
    }

    /// First global element of this rank's I/O slab.
    pub fn io_start(&self) -> u64 {
        self.io_start
    }

    /// Elements in this rank's I/O slab; 0 on non-I/O ranks.
    pub fn io_count(&self) -> u64 {
        self.io_count
    }

    /// Elements held by this rank on the compute side.
    pub fn n_compute(&self) -> usize {
        self.n_compute
    }

    pub fn aggregation(&self) -> &Aggregation {
        &self.agg
    }

    pub(crate) fn comm(&self) -> &Arc<dyn Comm> {
        &self.comm
    }

    /// Compute-side element count after aggregation: the full sub-group
    /// list on leaders, 0 on other members, `n_compute` when disabled.
    pub(crate) fn n_effective(&self) -> usize {
        self.comp_list.total
    }
}

impl AggPlan {
    /// Elements contributed per sub-group member (leader only).
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Element displacement of each member's block in the aggregated
    /// list (leader only; prefix sums of `counts`).
    pub fn displs(&self) -> &[usize] {
        &self.displs
    }

    /// Aggregated element count; non-zero only on the sub-group leader.
    pub fn n_compute_agg(&self) -> usize {
        self.n_compute_agg
    }

    pub fn is_leader(&self) -> bool {
        self.comm.rank() == 0
    }

    /// Funnel `src` (element-sized records) onto the leader.
    pub(crate) fn gather(&self, elem_bytes: usize, src: &[u8]) -> Result<Vec<u8>> {
        let byte_counts: Vec<usize> = self.counts.iter().map(|c| c * elem_bytes).collect();
        let mut out = alloc_buf(self.n_compute_agg * elem_bytes)?;
        self.comm.gather_v(0, src, &byte_counts, &mut out)?;
        Ok(out)
    }

    /// Spread the leader's aggregated records back to the members.
    pub(crate) fn scatter(&self, elem_bytes: usize, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let byte_counts: Vec<usize> = self.counts.iter().map(|c| c * elem_bytes).collect();
        self.comm.scatter_v(0, src, &byte_counts, dst)
    }
}

/// Build both exchange tables. Element ids route to the I/O task whose
/// contiguous range contains them; one id all-to-all teaches the I/O
/// side its per-source slab offsets, in the same per-peer order the
/// compute side will pack data.
fn build_exchange(
    comm: &Arc<dyn Comm>,
    ids: &[u64],
    n_global: u64,
    n_io_tasks: i32,
    stride: i32,
    io_start: u64,
    io_count: u64,
) -> Result<(ExchangeList, ExchangeList)> {
    let size = comm.size() as usize;

    let mut by_dest: BTreeMap<i32, Vec<u64>> = BTreeMap::new();
    for (i, &e) in ids.iter().enumerate() {
        if e >= n_global {
            return Err(Error::InvalidArgument("compute element index out of range"));
        }
        let dest = owner_of(n_global, n_io_tasks, e) * stride;
        by_dest.entry(dest).or_default().push(i as u64);
    }
    let comp_list = ExchangeList {
        peers: by_dest
            .into_iter()
            .map(|(rank, offsets)| Peer { rank, offsets })
            .collect(),
        total: ids.len(),
    };

    // Per-pair element counts first; the id exchange needs them on the
    // receive side.
    let mut counts_per_dest = vec![0u64; size];
    for p in &comp_list.peers {
        counts_per_dest[p.rank as usize] = p.offsets.len() as u64;
    }
    let mut cnt_send = Vec::with_capacity(size * 8);
    for &c in &counts_per_dest {
        cnt_send.extend_from_slice(&c.to_le_bytes());
    }
    let eight = vec![8usize; size];
    let mut cnt_recv = vec![0u8; size * 8];
    comm.all_to_all_v(&cnt_send, &eight, &mut cnt_recv, &eight)?;
    let counts_per_src: Vec<usize> = cnt_recv
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()) as usize)
        .collect();

    let mut id_send = Vec::with_capacity(ids.len() * 8);
    let mut send_counts = vec![0usize; size];
    for p in &comp_list.peers {
        send_counts[p.rank as usize] = p.offsets.len() * 8;
        for &off in &p.offsets {
            id_send.extend_from_slice(&ids[off as usize].to_le_bytes());
        }
    }
    let recv_counts: Vec<usize> = counts_per_src.iter().map(|&c| c * 8).collect();
    let total_recv: usize = counts_per_src.iter().sum();
    let mut id_recv = alloc_buf(total_recv * 8)?;
    comm.all_to_all_v(&id_send, &send_counts, &mut id_recv, &recv_counts)?;

    let mut io_peers = Vec::new();
    let mut pos = 0usize;
    for (src, &c) in counts_per_src.iter().enumerate() {
        if c == 0 {
            continue;
        }
        let mut offsets = Vec::with_capacity(c);
        for k in 0..c {
            let at = (pos + k) * 8;
            let e = u64::from_le_bytes(id_recv[at..at + 8].try_into().unwrap());
            if e < io_start || e >= io_start + io_count {
                return Err(Error::InvalidArgument("element routed outside I/O range"));
            }
            offsets.push(e - io_start);
        }
        pos += c;
        io_peers.push(Peer {
            rank: src as i32,
            offsets,
        });
    }
    let io_list = ExchangeList {
        peers: io_peers,
        total: total_recv,
    };

    Ok((comp_list, io_list))
}
