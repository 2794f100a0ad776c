//! Background writer: one thread per file, draining the write queue into
//! buffered non-blocking backend puts.
//!
//! Collective backend calls require every I/O rank to act in the same
//! round, but local queue lengths differ. The writers therefore agree on
//! queue state with a SUM all-reduce of per-rank emptiness over the
//! I/O-task communicator, and only progress on unanimous rounds: all
//! queues non-empty (dequeue one each) or all empty (flush, and exit once
//! nothing is outstanding). Exiting on a non-unanimous round would leak
//! requests on slower ranks and deadlock the next collective wait-all.

use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use crate::backend::{FileId, IoBackend, ReqId};
use crate::comm::{Comm, ReduceOp};
use crate::error::Error;
use crate::queue::WriteQueue;

/// The writer-visible half of a file, shared between the API thread and
/// the writer thread.
pub(crate) struct FileShared {
    pub backend: Arc<dyn IoBackend>,
    /// Backend file id; `Some` only on I/O-task ranks.
    pub backend_file: Option<FileId>,
    /// Per-file duplicate of the I/O-task-side communicator.
    pub io_comm: Arc<dyn Comm>,
    pub queue: WriteQueue,
    /// Outstanding-request bound; reaching it forces a wait-all.
    pub n_reqs: usize,
    /// Attached-buffer budget; the flush decision compares the global
    /// maximum projected usage against it.
    pub buf_size: u64,
    /// CPUs the writer is pinned to. A hint; empty disables pinning.
    pub writer_cpus: Vec<usize>,
    /// First error observed by the writer, surfaced by the next sync,
    /// close, or read on the file.
    pub write_error: Mutex<Option<Error>>,
}

impl FileShared {
    fn latch(&self, err: Error) {
        let mut slot = self.write_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn latch_backend(&self, errno: i32) {
        self.latch(Error::Library {
            kind: self.backend.kind(),
            errno,
        });
    }
}

/// Launch the writer thread. The caller holds the queue's ticket lock
/// and has already set the active flag.
pub(crate) fn spawn(shared: Arc<FileShared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("slabio-writer".into())
        .spawn(move || run(&shared))
}

fn run(shared: &FileShared) {
    if !shared.writer_cpus.is_empty() {
        pin_to_cpus(&shared.writer_cpus);
    }
    let n_io = shared.io_comm.size() as i64;
    let fid = match shared.backend_file {
        // Only I/O ranks enqueue, so only they launch a writer.
        Some(fid) => fid,
        None => {
            shared.latch(Error::Async("writer launched on a non-I/O rank"));
            shared.queue.set_active(false);
            return;
        }
    };

    let mut reqs: Vec<ReqId> = Vec::new();
    // Descriptor buffers consumed by posted puts; freed at wait-all.
    let mut held: Vec<Vec<u8>> = Vec::new();

    loop {
        let guard = shared.queue.ticket_lock();
        let empty = shared.queue.is_empty() as i64;
        let agreed = match shared.io_comm.all_reduce_i64(empty, ReduceOp::Sum) {
            Ok(sum) => sum,
            Err(e) => {
                shared.latch(e);
                shared.queue.set_active(false);
                return;
            }
        };
        if agreed != 0 && agreed != n_io {
            // Peers disagree about queue state; no collective backend
            // call may be issued this round.
            drop(guard);
            thread::yield_now();
            continue;
        }
        let desc = shared.queue.pop();
        if desc.is_none() && reqs.is_empty() {
            shared.queue.set_active(false);
            drop(guard);
            return;
        }
        drop(guard);

        match desc {
            Some(desc) => {
                // The per-rank buffer is private but the decision to
                // flush must be collective: reduce the projected usage
                // with MAX before posting.
                let usage = shared.backend.buffer_usage(fid).unwrap_or(0);
                let projected = usage.saturating_add(desc.buf.len() as u64) as i64;
                let max = match shared.io_comm.all_reduce_i64(projected, ReduceOp::Max) {
                    Ok(max) => max,
                    Err(e) => {
                        shared.latch(e);
                        let guard = shared.queue.ticket_lock();
                        shared.queue.set_active(false);
                        drop(guard);
                        return;
                    }
                };
                if max as u64 > shared.buf_size || reqs.len() >= shared.n_reqs {
                    flush(shared, fid, &mut reqs, &mut held);
                }
                match shared
                    .backend
                    .bput_vara(fid, desc.var, &desc.start, &desc.count, &desc.buf)
                {
                    Ok(req) => {
                        reqs.push(req);
                        held.push(desc.buf);
                    }
                    // Keep draining so the collective schedule stays
                    // matched across ranks.
                    Err(errno) => shared.latch_backend(errno),
                }
            }
            None => flush(shared, fid, &mut reqs, &mut held),
        }
    }
}

/// Collective wait-all: retire every posted request, then release the
/// descriptor buffers they consumed.
fn flush(shared: &FileShared, fid: FileId, reqs: &mut Vec<ReqId>, held: &mut Vec<Vec<u8>>) {
    if reqs.is_empty() {
        return;
    }
    match shared.backend.wait_all(fid, reqs) {
        Ok(statuses) => {
            for status in statuses {
                if status != 0 {
                    shared.latch_backend(status);
                }
            }
        }
        Err(errno) => shared.latch_backend(errno),
    }
    reqs.clear();
    held.clear();
}

#[cfg(target_os = "linux")]
fn pin_to_cpus(cpus: &[usize]) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        // Affinity is advisory; ignore failures.
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpus(_cpus: &[usize]) {}
