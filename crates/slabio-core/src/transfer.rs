//! Transfer engine: executes the compute/I-O redistribution described by
//! a decomposition, in either direction, for an arbitrary fixed element
//! size. Elements are opaque byte blocks, so one implementation serves
//! every scalar type (and whole inner-dimension rows at once).

use crate::decomp::Decomp;
use crate::error::{Error, Result};

/// Direction of a redistribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    CompToIo,
    IoToComp,
}

/// Zero-filled buffer with a checked reservation.
pub(crate) fn alloc_buf(len: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::MallocFailure)?;
    v.resize(len, 0);
    Ok(v)
}

/// Move fixed-size records between the compute-side buffer and the I/O
/// slab according to `decomp`. Collective over the decomposition's
/// communicator.
///
/// For `CompToIo`, `src` is the (possibly aggregated) compute buffer and
/// `dst` the I/O slab of `io_count` elements; for `IoToComp` the roles
/// reverse.
pub fn transfer_field(
    decomp: &Decomp,
    direction: Direction,
    elem_size: usize,
    src: &[u8],
    dst: &mut [u8],
) -> Result<()> {
    if elem_size == 0 {
        return Err(Error::InvalidArgument("element size must be non-zero"));
    }
    let comp_bytes = decomp.n_effective() * elem_size;
    let slab_bytes = decomp.io_count() as usize * elem_size;
    let (src_bytes, dst_bytes) = match direction {
        Direction::CompToIo => (comp_bytes, slab_bytes),
        Direction::IoToComp => (slab_bytes, comp_bytes),
    };
    if src.len() != src_bytes {
        return Err(Error::InvalidArgument("source buffer length mismatch"));
    }
    if dst.len() != dst_bytes {
        return Err(Error::InvalidArgument("destination buffer length mismatch"));
    }

    let (pack_list, unpack_list) = match direction {
        Direction::CompToIo => (&decomp.comp_list, &decomp.io_list),
        Direction::IoToComp => (&decomp.io_list, &decomp.comp_list),
    };

    let comm = decomp.comm();
    let size = comm.size() as usize;

    let mut send = alloc_buf(pack_list.total * elem_size)?;
    let mut send_counts = vec![0usize; size];
    let mut pos = 0usize;
    for p in &pack_list.peers {
        send_counts[p.rank as usize] = p.offsets.len() * elem_size;
        for &off in &p.offsets {
            let o = off as usize * elem_size;
            send[pos..pos + elem_size].copy_from_slice(&src[o..o + elem_size]);
            pos += elem_size;
        }
    }

    let mut recv_counts = vec![0usize; size];
    for p in &unpack_list.peers {
        recv_counts[p.rank as usize] = p.offsets.len() * elem_size;
    }
    let mut recv = alloc_buf(unpack_list.total * elem_size)?;
    comm.all_to_all_v(&send, &send_counts, &mut recv, &recv_counts)?;

    let mut pos = 0usize;
    for p in &unpack_list.peers {
        for &off in &p.offsets {
            let o = off as usize * elem_size;
            dst[o..o + elem_size].copy_from_slice(&recv[pos..pos + elem_size]);
            pos += elem_size;
        }
    }
    Ok(())
}
