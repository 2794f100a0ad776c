//! Real-MPI transport adapter over rsmpi.
//!
//! Both the API thread and a file's writer thread issue collectives, so
//! MPI must be initialised with `Threading::Multiple`
//! (`mpi::initialize_with_threading`).

use std::sync::Arc;

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::raw::FromRaw;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;

use crate::comm::{Comm, ReduceOp};
use crate::error::{Error, Result};

/// [`Comm`] implementation backed by an MPI communicator.
pub struct MpiComm {
    comm: SimpleCommunicator,
}

// The wrapped communicator is only used through collective calls, which
// are thread-safe under MPI_THREAD_MULTIPLE.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }
}

/// Foreign-language initialisation wrapper: convert a Fortran integer
/// communicator handle into a native communicator, ready to pass to
/// [`Context::init`](crate::Context::init).
pub fn comm_from_fortran(handle: i32) -> Result<Arc<dyn Comm>> {
    let raw = unsafe { mpi::ffi::MPI_Comm_f2c(handle) };
    if raw == unsafe { mpi::ffi::RSMPI_COMM_NULL } {
        return Err(Error::Fortran);
    }
    let comm = unsafe { SimpleCommunicator::from_raw(raw) };
    Ok(Arc::new(MpiComm::new(comm)))
}

fn to_counts(counts: &[usize]) -> Result<Vec<mpi::Count>> {
    counts
        .iter()
        .map(|&c| {
            mpi::Count::try_from(c).map_err(|_| Error::Mpi("byte count exceeds MPI count range".into()))
        })
        .collect()
}

fn displs_of(counts: &[mpi::Count]) -> Vec<mpi::Count> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut off: mpi::Count = 0;
    for &c in counts {
        displs.push(off);
        off += c;
    }
    displs
}

impl Comm for MpiComm {
    fn rank(&self) -> i32 {
        self.comm.rank()
    }

    fn size(&self) -> i32 {
        self.comm.size()
    }

    fn duplicate(&self) -> Result<Arc<dyn Comm>> {
        Ok(Arc::new(MpiComm::new(self.comm.duplicate())))
    }

    fn split(&self, color: i32, key: i32) -> Result<Arc<dyn Comm>> {
        match self
            .comm
            .split_by_color_with_key(Color::with_value(color), key)
        {
            Some(comm) => Ok(Arc::new(MpiComm::new(comm))),
            None => Err(Error::Mpi("split produced a null communicator".into())),
        }
    }

    fn all_reduce_i64(&self, value: i64, op: ReduceOp) -> Result<i64> {
        let mut out = 0i64;
        match op {
            ReduceOp::Sum => self
                .comm
                .all_reduce_into(&value, &mut out, SystemOperation::sum()),
            ReduceOp::Max => self
                .comm
                .all_reduce_into(&value, &mut out, SystemOperation::max()),
            ReduceOp::Min => self
                .comm
                .all_reduce_into(&value, &mut out, SystemOperation::min()),
        }
        Ok(out)
    }

    fn broadcast(&self, root: i32, buf: &mut [u8]) -> Result<()> {
        self.comm.process_at_rank(root).broadcast_into(buf);
        Ok(())
    }

    fn gather_i64(&self, root: i32, value: i64) -> Result<Vec<i64>> {
        let root_proc = self.comm.process_at_rank(root);
        if self.comm.rank() == root {
            let mut out = vec![0i64; self.comm.size() as usize];
            root_proc.gather_into_root(&value, &mut out[..]);
            Ok(out)
        } else {
            root_proc.gather_into(&value);
            Ok(Vec::new())
        }
    }

    fn gather_v(
        &self,
        root: i32,
        send: &[u8],
        recv_counts: &[usize],
        recv: &mut [u8],
    ) -> Result<()> {
        let root_proc = self.comm.process_at_rank(root);
        if self.comm.rank() == root {
            let counts = to_counts(recv_counts)?;
            let displs = displs_of(&counts);
            let mut partition = PartitionMut::new(recv, counts, displs);
            root_proc.gather_varcount_into_root(send, &mut partition);
        } else {
            root_proc.gather_varcount_into(send);
        }
        Ok(())
    }

    fn scatter_v(
        &self,
        root: i32,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
    ) -> Result<()> {
        let root_proc = self.comm.process_at_rank(root);
        if self.comm.rank() == root {
            let counts = to_counts(send_counts)?;
            let displs = displs_of(&counts);
            let partition = Partition::new(send, counts, displs);
            root_proc.scatter_varcount_into_root(&partition, recv);
        } else {
            root_proc.scatter_varcount_into(recv);
        }
        Ok(())
    }

    fn all_to_all_v(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<()> {
        let scounts = to_counts(send_counts)?;
        let sdispls = displs_of(&scounts);
        let rcounts = to_counts(recv_counts)?;
        let rdispls = displs_of(&rcounts);
        let sp = Partition::new(send, scounts, sdispls);
        let mut rp = PartitionMut::new(recv, rcounts, rdispls);
        self.comm.all_to_all_varcount_into(&sp, &mut rp);
        Ok(())
    }
}
