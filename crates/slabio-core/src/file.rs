//! File abstraction: define/data state machine, metadata definition and
//! inquiry, record frames, and the public write/read paths.
//!
//! Every metadata operation follows one collective pattern: *the I/O rank
//! acts, the I/O group broadcasts the status*. The I/O rank is rank 0 of
//! its group communicator, calls the backend primitive, and the resulting
//! error code is broadcast so every rank in the group takes the same
//! success/failure branch.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::backend::{AttValue, IoBackend, VarId};
use crate::comm::Comm;
use crate::context::Context;
use crate::decomp::{Aggregation, Decomp};
use crate::error::{Error, Result};
use crate::queue::{WriteDesc, WriteQueue};
use crate::transfer::{Direction, alloc_buf, transfer_field};
use crate::vartype::VarType;
use crate::writer;
use crate::writer::FileShared;

/// Maximum length of a dimension or variable name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

bitflags! {
    /// File open mode. At least one flag must be set; `CREATE` wins over
    /// the others when combined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const CREATE = 0x01;
        const WRITE  = 0x02;
        const READ   = 0x04;
    }
}

/// Define/data state of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Define,
    Data,
}

/// Dimension description visible on every rank after an inquiry.
#[derive(Debug, Clone, Copy)]
pub struct DimInquiry {
    pub len: u64,
    pub is_record: bool,
}

/// Variable description visible on every rank after an inquiry.
///
/// The backend variable id is resolved on the I/O rank only; other
/// ranks never touch it.
#[derive(Debug, Clone)]
pub struct VarInquiry {
    pub vtype: VarType,
    pub dims: Vec<DimInquiry>,
    pub(crate) var: VarId,
}

/// An open file.
///
/// Dropping a `File` without [`File::close`] performs no collective
/// action: the writer (if any) drains on its own, but the backend file
/// stays open on I/O ranks. `close` is the shutdown path.
pub struct File {
    ctx: Arc<Context>,
    shared: Arc<FileShared>,
    group_comm: Arc<dyn Comm>,
    state: FileState,
    frame: i64,
    mode: FileMode,
    path: String,
    closed: bool,
}

impl File {
    /// Open `path` through `backend`. Collective over the context's
    /// parent communicator: I/O ranks create or open the backend file
    /// and, for writable modes, attach the buffer that backs
    /// non-blocking puts.
    pub fn open(
        ctx: &Arc<Context>,
        backend: Arc<dyn IoBackend>,
        path: &str,
        mode: FileMode,
    ) -> Result<File> {
        if mode.is_empty() {
            return Err(Error::InvalidArgument("no file mode flags set"));
        }
        if path.is_empty() {
            return Err(Error::InvalidArgument("empty file path"));
        }

        // Per-file duplicates keep this file's collective schedule
        // independent of the context's and of every other file's.
        let io_comm = ctx.io_comm().duplicate()?;
        let group_comm = ctx.group_comm().duplicate()?;

        let mut ierr = 0i32;
        let mut backend_file = None;
        if ctx.is_io_task() {
            let opened = if mode.contains(FileMode::CREATE) {
                backend.create(path)
            } else {
                backend.open(path, !mode.contains(FileMode::WRITE))
            };
            match opened {
                Ok(fid) => {
                    backend_file = Some(fid);
                    if mode.intersects(FileMode::CREATE | FileMode::WRITE) {
                        if let Err(e) = backend.attach_buffer(fid, ctx.config().buf_size) {
                            ierr = e;
                        }
                    }
                }
                Err(e) => ierr = e,
            }
        }
        let ierr = bcast_i32(&group_comm, ierr)?;
        if ierr != 0 {
            if let Some(fid) = backend_file {
                let _ = backend.close(fid);
            }
            return Err(ctx.latch_backend_error(backend.kind(), ierr, backend.strerror(ierr)));
        }

        let state = if mode.contains(FileMode::CREATE) {
            FileState::Define
        } else {
            FileState::Data
        };
        let config = ctx.config();
        let shared = Arc::new(FileShared {
            backend,
            backend_file,
            io_comm,
            queue: WriteQueue::new(),
            n_reqs: config.n_reqs,
            buf_size: config.buf_size,
            writer_cpus: config.writer_cpus.clone(),
            write_error: Mutex::new(None),
        });

        Ok(File {
            ctx: Arc::clone(ctx),
            shared,
            group_comm,
            state,
            frame: 0,
            mode,
            path: path.to_string(),
            closed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// Record-dimension index used by subsequent writes and reads.
    pub fn get_frame(&self) -> i64 {
        self.frame
    }

    /// Set the record-dimension cursor. Frames are a monotonic hint;
    /// going backwards is permitted. No collective action.
    pub fn set_frame(&mut self, frame: i64) -> Result<()> {
        if frame < 0 {
            return Err(Error::InvalidArgument("negative frame"));
        }
        self.frame = frame;
        Ok(())
    }

    /// Define a dimension; `None` length defines the record dimension.
    pub fn define_dim(&mut self, name: &str, len: Option<u64>) -> Result<()> {
        check_name(name)?;
        if len == Some(0) {
            return Err(Error::InvalidArgument("zero-length dimension"));
        }
        self.ensure_define()?;
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            if let Err(e) = self.shared.backend.def_dim(fid, name, len) {
                ierr = e;
            }
        }
        self.finish_group_call(ierr)
    }

    /// Define a variable over previously defined dimensions. The record
    /// dimension, if used, must be the first (slowest) dimension.
    pub fn define_var(&mut self, name: &str, vtype: VarType, dims: &[&str]) -> Result<()> {
        check_name(name)?;
        for d in dims {
            check_name(d)?;
        }
        if vtype.size().is_none() {
            return Err(Error::InvalidArgument("unknown variable type"));
        }
        self.ensure_define()?;
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            ierr = (|| {
                let mut dim_ids = Vec::with_capacity(dims.len());
                for d in dims {
                    dim_ids.push(self.shared.backend.inq_dim(fid, d)?.id);
                }
                self.shared.backend.def_var(fid, name, vtype, &dim_ids)?;
                Ok::<_, i32>(0)
            })()
            .unwrap_or_else(|e| e);
        }
        self.finish_group_call(ierr)
    }

    /// Write an attribute on a variable, or on the file when `var` is
    /// `None`.
    pub fn define_att(&mut self, var: Option<&str>, name: &str, value: &AttValue) -> Result<()> {
        check_name(name)?;
        if let Some(v) = var {
            check_name(v)?;
        }
        self.ensure_define()?;
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            ierr = (|| {
                let var_id = match var {
                    Some(v) => Some(self.shared.backend.inq_var(fid, v)?.id),
                    None => None,
                };
                self.shared.backend.put_att(fid, var_id, name, value)?;
                Ok::<_, i32>(0)
            })()
            .unwrap_or_else(|e| e);
        }
        self.finish_group_call(ierr)
    }

    /// Dimension length (and record-ness) by name, on every rank.
    pub fn inquire_dim(&self, name: &str) -> Result<DimInquiry> {
        check_name(name)?;
        let mut payload = [0u8; 13];
        if let Some(fid) = self.shared.backend_file {
            match self.shared.backend.inq_dim(fid, name) {
                Ok(desc) => {
                    payload[4..12].copy_from_slice(&desc.len.to_le_bytes());
                    payload[12] = desc.is_record as u8;
                }
                Err(e) => payload[0..4].copy_from_slice(&e.to_le_bytes()),
            }
        }
        self.group_comm.broadcast(0, &mut payload)?;
        let ierr = i32::from_le_bytes(payload[0..4].try_into().unwrap());
        if ierr != 0 {
            return Err(self.latch(ierr));
        }
        Ok(DimInquiry {
            len: u64::from_le_bytes(payload[4..12].try_into().unwrap()),
            is_record: payload[12] != 0,
        })
    }

    /// Variable type and dimensions by name, on every rank.
    pub fn inquire_var(&self, name: &str) -> Result<VarInquiry> {
        check_name(name)?;
        let mut header = [0u8; 12];
        let mut local: Option<VarInquiry> = None;
        if let Some(fid) = self.shared.backend_file {
            match self.var_desc_on_io_rank(fid, name) {
                Ok(inq) => {
                    header[4..8].copy_from_slice(&inq.vtype.code().to_le_bytes());
                    header[8..12].copy_from_slice(&(inq.dims.len() as i32).to_le_bytes());
                    local = Some(inq);
                }
                Err(e) => header[0..4].copy_from_slice(&e.to_le_bytes()),
            }
        }
        self.group_comm.broadcast(0, &mut header)?;
        let ierr = i32::from_le_bytes(header[0..4].try_into().unwrap());
        if ierr != 0 {
            return Err(self.latch(ierr));
        }
        let vtype = VarType::from_code(i32::from_le_bytes(header[4..8].try_into().unwrap()));
        let ndims = i32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

        let mut dims_payload = vec![0u8; ndims * 9];
        if let Some(inq) = &local {
            for (i, d) in inq.dims.iter().enumerate() {
                dims_payload[i * 9..i * 9 + 8].copy_from_slice(&d.len.to_le_bytes());
                dims_payload[i * 9 + 8] = d.is_record as u8;
            }
        }
        if ndims > 0 {
            self.group_comm.broadcast(0, &mut dims_payload)?;
        }
        let dims = (0..ndims)
            .map(|i| DimInquiry {
                len: u64::from_le_bytes(dims_payload[i * 9..i * 9 + 8].try_into().unwrap()),
                is_record: dims_payload[i * 9 + 8] != 0,
            })
            .collect();
        Ok(VarInquiry {
            vtype,
            dims,
            var: local.map(|inq| inq.var).unwrap_or(VarId(-1)),
        })
    }

    /// Attribute value by name, on every rank.
    pub fn inquire_att(&self, var: Option<&str>, name: &str) -> Result<AttValue> {
        check_name(name)?;
        if let Some(v) = var {
            check_name(v)?;
        }
        let mut header = [0u8; 9];
        let mut local = Vec::new();
        if let Some(fid) = self.shared.backend_file {
            let fetched = (|| {
                let var_id = match var {
                    Some(v) => Some(self.shared.backend.inq_var(fid, v)?.id),
                    None => None,
                };
                self.shared.backend.get_att(fid, var_id, name)
            })();
            match fetched {
                Ok(value) => {
                    let (tag, bytes) = att_to_bytes(&value);
                    header[4] = tag;
                    header[5..9].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                    local = bytes;
                }
                Err(e) => header[0..4].copy_from_slice(&e.to_le_bytes()),
            }
        }
        self.group_comm.broadcast(0, &mut header)?;
        let ierr = i32::from_le_bytes(header[0..4].try_into().unwrap());
        if ierr != 0 {
            return Err(self.latch(ierr));
        }
        let tag = header[4];
        let len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
        local.resize(len, 0);
        self.group_comm.broadcast(0, &mut local)?;
        att_from_bytes(tag, &local)
    }

    /// Write one variable. With a decomposition, `buf` holds this rank's
    /// `n_compute` elements and the data is redistributed onto the I/O
    /// slabs; without one, rank 0's `buf` holds the whole variable.
    ///
    /// The write itself is asynchronous: I/O ranks enqueue a descriptor
    /// for the background writer and return. Non-I/O ranks return once
    /// the redistribution is done. Writer-side failures surface at the
    /// next [`File::sync`], [`File::close`], or [`File::get_var`].
    pub fn put_var(&mut self, name: &str, decomp: Option<&Decomp>, buf: &[u8]) -> Result<()> {
        if !self.mode.intersects(FileMode::CREATE | FileMode::WRITE) {
            return Err(Error::InvalidArgument("file not open for writing"));
        }
        let info = self.inquire_var(name)?;
        let plan = self.build_access(&info, decomp)?;

        let out_buf: Vec<u8> = if let Some(d) = decomp {
            if buf.len() != d.n_compute() * plan.elem_bytes {
                return Err(Error::InvalidArgument("compute buffer length mismatch"));
            }
            let gathered;
            let effective: &[u8] = match d.aggregation() {
                Aggregation::Disabled => buf,
                Aggregation::Grouped(agg) => {
                    gathered = agg.gather(plan.elem_bytes, buf)?;
                    &gathered
                }
            };
            let mut out = alloc_buf(d.io_count() as usize * plan.elem_bytes)?;
            transfer_field(d, Direction::CompToIo, plan.elem_bytes, effective, &mut out)?;
            out
        } else if self.ctx.rank() == 0 {
            let total = plan.total_bytes();
            if buf.len() != total {
                return Err(Error::InvalidArgument("buffer length mismatch"));
            }
            // The descriptor owns a private copy so the caller's buffer
            // is free as soon as this call returns.
            let mut copy = alloc_buf(total)?;
            copy.copy_from_slice(buf);
            copy
        } else {
            Vec::new()
        };

        self.ensure_data()?;

        if self.ctx.is_io_task() {
            let mut count = plan.count;
            if decomp.is_none() && self.ctx.rank() != 0 {
                for c in &mut count {
                    *c = 0;
                }
            }
            let desc = WriteDesc {
                var: info.var,
                start: plan.start,
                count,
                buf: out_buf,
            };
            let guard = self.shared.queue.ticket_lock();
            self.shared.queue.push(desc);
            if !self.shared.queue.is_active() {
                // A previous writer may have exited after draining; its
                // handle must be joined before a new one is launched.
                if let Some(handle) = self.shared.queue.take_writer() {
                    let _ = handle.join();
                }
                self.shared.queue.set_active(true);
                match writer::spawn(Arc::clone(&self.shared)) {
                    Ok(handle) => self.shared.queue.store_writer(handle),
                    Err(_) => {
                        self.shared.queue.set_active(false);
                        drop(guard);
                        return Err(Error::Async("failed to spawn writer thread"));
                    }
                }
            }
            drop(guard);
        }
        Ok(())
    }

    /// Read one variable. Synchronous with respect to the writer: all
    /// pending writes on this file complete first.
    pub fn get_var(&mut self, name: &str, decomp: Option<&Decomp>, buf: &mut [u8]) -> Result<()> {
        self.drain_writer()?;
        let info = self.inquire_var(name)?;
        let plan = self.build_access(&info, decomp)?;
        self.ensure_data()?;

        if let Some(d) = decomp {
            if buf.len() != d.n_compute() * plan.elem_bytes {
                return Err(Error::InvalidArgument("compute buffer length mismatch"));
            }
            let mut slab = alloc_buf(d.io_count() as usize * plan.elem_bytes)?;
            let mut ierr = 0i32;
            if let Some(fid) = self.shared.backend_file {
                if let Err(e) =
                    self.shared
                        .backend
                        .get_vara(fid, info.var, &plan.start, &plan.count, &mut slab)
                {
                    ierr = e;
                }
            }
            // The transfer below spans the parent communicator, so the
            // read status must be agreed globally, not per group: a
            // group-local error branch would desynchronise it. Errno
            // sign is backend-specific, so reduce both ways.
            let min = self
                .ctx
                .comm()
                .all_reduce_i64(ierr as i64, crate::comm::ReduceOp::Min)?;
            let max = self
                .ctx
                .comm()
                .all_reduce_i64(ierr as i64, crate::comm::ReduceOp::Max)?;
            let agreed = if min != 0 { min } else { max };
            if agreed != 0 {
                return Err(self.latch(agreed as i32));
            }

            match d.aggregation() {
                Aggregation::Disabled => {
                    transfer_field(d, Direction::IoToComp, plan.elem_bytes, &slab, buf)?;
                }
                Aggregation::Grouped(agg) => {
                    let mut staged = alloc_buf(agg.n_compute_agg() * plan.elem_bytes)?;
                    transfer_field(d, Direction::IoToComp, plan.elem_bytes, &slab, &mut staged)?;
                    agg.scatter(plan.elem_bytes, &staged, buf)?;
                }
            }
        } else {
            if buf.len() != plan.total_bytes() {
                return Err(Error::InvalidArgument("buffer length mismatch"));
            }
            let mut ierr = 0i32;
            if let Some(fid) = self.shared.backend_file {
                if let Err(e) =
                    self.shared
                        .backend
                        .get_vara(fid, info.var, &plan.start, &plan.count, buf)
                {
                    ierr = e;
                }
            }
            let ierr = bcast_i32(&self.group_comm, ierr)?;
            if ierr != 0 {
                return Err(self.latch(ierr));
            }
            // The I/O rank read the data; hand it to the rest of the
            // group.
            self.group_comm.broadcast(0, buf)?;
        }
        Ok(())
    }

    /// Flush the file: drains the writer, leaves define mode if needed,
    /// and syncs the backend. Establishes a happens-before with every
    /// descriptor enqueued prior to the call.
    pub fn sync(&mut self) -> Result<()> {
        self.drain_writer()?;
        self.ensure_data()?;
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            if let Err(e) = self.shared.backend.sync(fid) {
                ierr = e;
            }
        }
        self.finish_group_call(ierr)
    }

    /// Close the file: drains the writer, detaches the buffer, and
    /// closes the backend file on I/O ranks. Collective.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let drained = self.drain_writer();
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            if self.mode.intersects(FileMode::CREATE | FileMode::WRITE) {
                let _ = self.shared.backend.detach_buffer(fid);
            }
            if let Err(e) = self.shared.backend.close(fid) {
                ierr = e;
            }
        }
        let closed = self.finish_group_call(ierr);
        drained.and(closed)
    }

    // --- internals ---

    /// Join the writer (waiting for the collective drain to finish) and
    /// surface any error it latched.
    fn drain_writer(&self) -> Result<()> {
        if let Some(handle) = self.shared.queue.take_writer() {
            handle
                .join()
                .map_err(|_| Error::Async("writer thread panicked"))?;
        }
        if let Some(err) = self.shared.write_error.lock().unwrap().take() {
            if let Error::Library { kind, errno } = err {
                return Err(self.ctx.latch_backend_error(
                    kind,
                    errno,
                    self.shared.backend.strerror(errno),
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    /// `Data -> Define` transition (backend redef) when needed.
    fn ensure_define(&mut self) -> Result<()> {
        if self.state == FileState::Define {
            return Ok(());
        }
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            if let Err(e) = self.shared.backend.redef(fid) {
                ierr = e;
            }
        }
        self.finish_group_call(ierr)?;
        self.state = FileState::Define;
        Ok(())
    }

    /// `Define -> Data` transition (backend enddef) when needed.
    fn ensure_data(&mut self) -> Result<()> {
        if self.state == FileState::Data {
            return Ok(());
        }
        let mut ierr = 0i32;
        if let Some(fid) = self.shared.backend_file {
            if let Err(e) = self.shared.backend.enddef(fid) {
                ierr = e;
            }
        }
        self.finish_group_call(ierr)?;
        self.state = FileState::Data;
        Ok(())
    }

    /// Broadcast the I/O rank's status over the group and latch on
    /// failure.
    fn finish_group_call(&self, ierr: i32) -> Result<()> {
        let ierr = bcast_i32(&self.group_comm, ierr)?;
        if ierr != 0 {
            return Err(self.latch(ierr));
        }
        Ok(())
    }

    fn latch(&self, errno: i32) -> Error {
        self.ctx.latch_backend_error(
            self.shared.backend.kind(),
            errno,
            self.shared.backend.strerror(errno),
        )
    }

    fn var_desc_on_io_rank(&self, fid: crate::backend::FileId, name: &str) -> BackendVarInquiry {
        let desc = self.shared.backend.inq_var(fid, name)?;
        let mut dims = Vec::with_capacity(desc.dims.len());
        for &dim in &desc.dims {
            let (len, is_record) = self.shared.backend.inq_dim_len(fid, dim)?;
            dims.push(DimInquiry { len, is_record });
        }
        Ok(VarInquiry {
            vtype: desc.vtype,
            dims,
            var: desc.id,
        })
    }

    /// Derive the access hyperslab for this rank: full extent per
    /// dimension, the current frame on the record dimension (always axis
    /// 0), and the I/O slab range on the decomposed dimension (the
    /// slowest non-record one). Inner dimensions fold into the element
    /// size so the transfer engine moves whole rows.
    fn build_access(&self, info: &VarInquiry, decomp: Option<&Decomp>) -> Result<AccessPlan> {
        let type_size = info
            .vtype
            .size()
            .ok_or(Error::InvalidArgument("unknown variable type"))?;
        let ndims = info.dims.len();
        let mut start = vec![0u64; ndims];
        let mut count: Vec<u64> = info.dims.iter().map(|d| d.len).collect();
        let has_record = ndims > 0 && info.dims[0].is_record;
        if has_record {
            start[0] = self.frame as u64;
            count[0] = 1;
        }
        let mut elem_bytes = type_size;
        if let Some(d) = decomp {
            let axis = if has_record { 1 } else { 0 };
            if axis >= ndims {
                return Err(Error::InvalidArgument("variable has no decomposed dimension"));
            }
            start[axis] = d.io_start();
            count[axis] = d.io_count();
            for dim in &info.dims[axis + 1..] {
                elem_bytes *= dim.len as usize;
            }
        }
        Ok(AccessPlan {
            start,
            count,
            elem_bytes,
            type_size,
        })
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed {
            // No collectives here: an unmatched broadcast would hang
            // peer ranks. The writer keeps draining on its own.
            self.closed = true;
        }
    }
}

struct AccessPlan {
    start: Vec<u64>,
    count: Vec<u64>,
    /// Bytes moved per decomposed element (type size x inner dims).
    elem_bytes: usize,
    type_size: usize,
}

impl AccessPlan {
    /// Bytes covered by the whole hyperslab (non-decomposed access).
    fn total_bytes(&self) -> usize {
        self.count.iter().product::<u64>() as usize * self.type_size
    }
}

type BackendVarInquiry = std::result::Result<VarInquiry, i32>;

/// Broadcast a status code from group rank 0 (the I/O rank).
fn bcast_i32(comm: &Arc<dyn Comm>, value: i32) -> Result<i32> {
    let mut buf = value.to_le_bytes();
    comm.broadcast(0, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument("name longer than MAX_NAME_LEN"));
    }
    Ok(())
}

fn att_to_bytes(value: &AttValue) -> (u8, Vec<u8>) {
    match value {
        AttValue::Text(s) => (0, s.as_bytes().to_vec()),
        AttValue::Int32(v) => (1, v.to_le_bytes().to_vec()),
        AttValue::Real32(v) => (2, v.to_le_bytes().to_vec()),
        AttValue::Real64(v) => (3, v.to_le_bytes().to_vec()),
    }
}

fn att_from_bytes(tag: u8, bytes: &[u8]) -> Result<AttValue> {
    match tag {
        0 => Ok(AttValue::Text(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Mpi("attribute broadcast not valid UTF-8".into()))?,
        )),
        1 if bytes.len() == 4 => Ok(AttValue::Int32(i32::from_le_bytes(bytes.try_into().unwrap()))),
        2 if bytes.len() == 4 => Ok(AttValue::Real32(f32::from_le_bytes(bytes.try_into().unwrap()))),
        3 if bytes.len() == 8 => Ok(AttValue::Real64(f64::from_le_bytes(bytes.try_into().unwrap()))),
        _ => Err(Error::Mpi("malformed attribute broadcast".into())),
    }
}
