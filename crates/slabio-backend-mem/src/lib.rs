//! In-process, shared-memory implementation of the slabio backend
//! contract.
//!
//! One `MemBackend` instance is shared (via `Arc`) by every rank thread,
//! so ranks opening the same path attach to the same underlying file —
//! the in-process equivalent of a collective create/open. Buffered puts
//! are copied into per-handle pending lists and applied to the shared
//! store at `wait_all`, with attached-buffer accounting, which makes the
//! back-pressure behaviour of the write pipeline observable through
//! [`MemBackend::stats`].
//!
//! Define-mode metadata is replicated on every I/O rank: redefining an
//! identical dimension or variable returns the existing id, and
//! `redef`/`enddef` are idempotent at the store level, so rank threads
//! may reach the calls at different times.

use std::collections::HashMap;
use std::sync::Mutex;

use slabio_core::backend::{
    AttValue, BackendResult, DimDesc, DimId, FileId, IoBackend, ReqId, VarDesc, VarId,
};
use slabio_core::vartype::VarType;

/// Backend error numbers. Opaque to the core library; resolved to text
/// by [`MemBackend::strerror`].
pub mod errno {
    pub const FILE_NOT_FOUND: i32 = -31;
    pub const READ_ONLY: i32 = -37;
    pub const IN_DEFINE_MODE: i32 = -38;
    pub const NOT_IN_DEFINE_MODE: i32 = -39;
    pub const INVALID_COORDS: i32 = -40;
    pub const NAME_IN_USE: i32 = -42;
    pub const ATT_NOT_FOUND: i32 = -43;
    pub const ONE_UNLIMITED: i32 = -44;
    pub const BAD_TYPE: i32 = -45;
    pub const DIM_NOT_FOUND: i32 = -46;
    pub const RECORD_NOT_FIRST: i32 = -47;
    pub const VAR_NOT_FOUND: i32 = -49;
    pub const BAD_ID: i32 = -33;
    pub const BAD_REQUEST: i32 = -34;
    pub const NO_BUFFER: i32 = -528;
    pub const INSUFFICIENT_BUFFER: i32 = -529;
}

/// Counters for one file, summed over all handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub bput_calls: u64,
    pub wait_all_calls: u64,
    pub flushed_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Define,
    Data,
}

struct MemDim {
    name: String,
    len: u64,
    unlimited: bool,
}

struct MemVar {
    name: String,
    vtype: VarType,
    dims: Vec<usize>,
    /// True when dim 0 is the record dimension.
    record: bool,
    /// Lengths of the non-record dimensions, snapshot at definition.
    inner_lens: Vec<u64>,
    /// Bytes of one frame (non-record vars have exactly one frame).
    frame_bytes: usize,
    frames: Vec<Vec<u8>>,
}

struct MemFile {
    mode: Mode,
    open_count: usize,
    dims: Vec<MemDim>,
    vars: Vec<MemVar>,
    atts: Vec<(Option<usize>, String, AttValue)>,
    num_records: u64,
    stats: Stats,
}

impl MemFile {
    fn fresh() -> Self {
        MemFile {
            mode: Mode::Define,
            open_count: 0,
            dims: Vec::new(),
            vars: Vec::new(),
            atts: Vec::new(),
            num_records: 0,
            stats: Stats::default(),
        }
    }
}

struct PendingPut {
    req: u64,
    var: usize,
    start: Vec<u64>,
    count: Vec<u64>,
    data: Vec<u8>,
}

struct Handle {
    file: usize,
    readonly: bool,
    cap: Option<u64>,
    usage: u64,
    pending: Vec<PendingPut>,
}

struct Store {
    files: Vec<MemFile>,
    by_path: HashMap<String, usize>,
    handles: HashMap<u64, Handle>,
    next_handle: u64,
    next_req: u64,
}

/// The shared in-memory backend.
pub struct MemBackend {
    store: Mutex<Store>,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend {
            store: Mutex::new(Store {
                files: Vec::new(),
                by_path: HashMap::new(),
                handles: HashMap::new(),
                next_handle: 1,
                next_req: 1,
            }),
        }
    }

    /// Counters for the file at `path`, if it was ever created.
    pub fn stats(&self, path: &str) -> Option<Stats> {
        let store = self.store.lock().unwrap();
        store.by_path.get(path).map(|&idx| store.files[idx].stats)
    }
}

impl Store {
    fn handle(&self, fid: FileId) -> Result<&Handle, i32> {
        self.handles.get(&fid.0).ok_or(errno::BAD_ID)
    }

    fn handle_mut(&mut self, fid: FileId) -> Result<&mut Handle, i32> {
        self.handles.get_mut(&fid.0).ok_or(errno::BAD_ID)
    }

    fn new_handle(&mut self, file: usize, readonly: bool) -> FileId {
        let id = self.next_handle;
        self.next_handle += 1;
        self.files[file].open_count += 1;
        self.handles.insert(
            id,
            Handle {
                file,
                readonly,
                cap: None,
                usage: 0,
                pending: Vec::new(),
            },
        );
        FileId(id)
    }

    /// Apply every pending put of `fid`, in request order.
    fn flush_handle(&mut self, fid: FileId) -> Result<(), i32> {
        let handle = self.handles.get_mut(&fid.0).ok_or(errno::BAD_ID)?;
        let pending = std::mem::take(&mut handle.pending);
        handle.usage = 0;
        let file_idx = handle.file;
        for put in pending {
            apply_put(&mut self.files[file_idx], put);
        }
        Ok(())
    }
}

impl IoBackend for MemBackend {
    fn kind(&self) -> &'static str {
        "mem"
    }

    fn create(&self, path: &str) -> BackendResult<FileId> {
        let mut store = self.store.lock().unwrap();
        let idx = match store.by_path.get(path) {
            Some(&idx) => {
                if store.files[idx].open_count == 0 {
                    // A fresh collective create truncates.
                    store.files[idx] = MemFile::fresh();
                }
                idx
            }
            None => {
                store.files.push(MemFile::fresh());
                let idx = store.files.len() - 1;
                store.by_path.insert(path.to_string(), idx);
                idx
            }
        };
        Ok(store.new_handle(idx, false))
    }

    fn open(&self, path: &str, readonly: bool) -> BackendResult<FileId> {
        let mut store = self.store.lock().unwrap();
        let idx = *store.by_path.get(path).ok_or(errno::FILE_NOT_FOUND)?;
        if store.files[idx].open_count == 0 {
            store.files[idx].mode = Mode::Data;
        }
        Ok(store.new_handle(idx, readonly))
    }

    fn close(&self, file: FileId) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        store.flush_handle(file)?;
        let handle = store.handles.remove(&file.0).ok_or(errno::BAD_ID)?;
        store.files[handle.file].open_count -= 1;
        Ok(())
    }

    fn attach_buffer(&self, file: FileId, bytes: u64) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        store.handle_mut(file)?.cap = Some(bytes);
        Ok(())
    }

    fn detach_buffer(&self, file: FileId) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        store.flush_handle(file)?;
        store.handle_mut(file)?.cap = None;
        Ok(())
    }

    fn redef(&self, file: FileId) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        let idx = store.handle(file)?.file;
        store.files[idx].mode = Mode::Define;
        Ok(())
    }

    fn enddef(&self, file: FileId) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        let idx = store.handle(file)?.file;
        store.files[idx].mode = Mode::Data;
        Ok(())
    }

    fn sync(&self, file: FileId) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        store.flush_handle(file)
    }

    fn def_dim(&self, file: FileId, name: &str, len: Option<u64>) -> BackendResult<DimId> {
        let mut store = self.store.lock().unwrap();
        let handle = store.handle(file)?;
        if handle.readonly {
            return Err(errno::READ_ONLY);
        }
        let idx = handle.file;
        let f = &mut store.files[idx];
        let unlimited = len.is_none();
        let len = len.unwrap_or(0);
        if let Some(pos) = f.dims.iter().position(|d| d.name == name) {
            let d = &f.dims[pos];
            // Replicated define: identical redefinition returns the id.
            if d.len == len && d.unlimited == unlimited {
                return Ok(DimId(pos as i32));
            }
            return Err(errno::NAME_IN_USE);
        }
        if f.mode == Mode::Data {
            return Err(errno::NOT_IN_DEFINE_MODE);
        }
        if unlimited && f.dims.iter().any(|d| d.unlimited) {
            return Err(errno::ONE_UNLIMITED);
        }
        f.dims.push(MemDim {
            name: name.to_string(),
            len,
            unlimited,
        });
        Ok(DimId(f.dims.len() as i32 - 1))
    }

    fn def_var(
        &self,
        file: FileId,
        name: &str,
        vtype: VarType,
        dims: &[DimId],
    ) -> BackendResult<VarId> {
        let mut store = self.store.lock().unwrap();
        let handle = store.handle(file)?;
        if handle.readonly {
            return Err(errno::READ_ONLY);
        }
        let idx = handle.file;
        let f = &mut store.files[idx];
        let es = vtype.size().ok_or(errno::BAD_TYPE)?;
        let dim_idx: Vec<usize> = dims.iter().map(|d| d.0 as usize).collect();
        if dim_idx.iter().any(|&d| d >= f.dims.len()) {
            return Err(errno::DIM_NOT_FOUND);
        }
        if let Some(pos) = f.vars.iter().position(|v| v.name == name) {
            let v = &f.vars[pos];
            if v.vtype == vtype && v.dims == dim_idx {
                return Ok(VarId(pos as i32));
            }
            return Err(errno::NAME_IN_USE);
        }
        if f.mode == Mode::Data {
            return Err(errno::NOT_IN_DEFINE_MODE);
        }
        for (i, &d) in dim_idx.iter().enumerate() {
            if f.dims[d].unlimited && i != 0 {
                return Err(errno::RECORD_NOT_FIRST);
            }
        }
        let record = dim_idx.first().is_some_and(|&d| f.dims[d].unlimited);
        let inner: &[usize] = if record { &dim_idx[1..] } else { &dim_idx };
        let inner_lens: Vec<u64> = inner.iter().map(|&d| f.dims[d].len).collect();
        let frame_bytes = inner_lens.iter().product::<u64>() as usize * es;
        let frames = if record {
            Vec::new()
        } else {
            vec![vec![0u8; frame_bytes]]
        };
        f.vars.push(MemVar {
            name: name.to_string(),
            vtype,
            dims: dim_idx,
            record,
            inner_lens,
            frame_bytes,
            frames,
        });
        Ok(VarId(f.vars.len() as i32 - 1))
    }

    fn put_att(
        &self,
        file: FileId,
        var: Option<VarId>,
        name: &str,
        value: &AttValue,
    ) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        let handle = store.handle(file)?;
        if handle.readonly {
            return Err(errno::READ_ONLY);
        }
        let idx = handle.file;
        let f = &mut store.files[idx];
        let var_idx = match var {
            Some(v) => {
                let v = v.0 as usize;
                if v >= f.vars.len() {
                    return Err(errno::VAR_NOT_FOUND);
                }
                Some(v)
            }
            None => None,
        };
        if let Some(slot) = f
            .atts
            .iter_mut()
            .find(|(v, n, _)| *v == var_idx && n == name)
        {
            slot.2 = value.clone();
        } else {
            f.atts.push((var_idx, name.to_string(), value.clone()));
        }
        Ok(())
    }

    fn get_att(&self, file: FileId, var: Option<VarId>, name: &str) -> BackendResult<AttValue> {
        let store = self.store.lock().unwrap();
        let f = &store.files[store.handle(file)?.file];
        let var_idx = match var {
            Some(v) => {
                let v = v.0 as usize;
                if v >= f.vars.len() {
                    return Err(errno::VAR_NOT_FOUND);
                }
                Some(v)
            }
            None => None,
        };
        f.atts
            .iter()
            .find(|(v, n, _)| *v == var_idx && n == name)
            .map(|(_, _, value)| value.clone())
            .ok_or(errno::ATT_NOT_FOUND)
    }

    fn inq_dim(&self, file: FileId, name: &str) -> BackendResult<DimDesc> {
        let store = self.store.lock().unwrap();
        let f = &store.files[store.handle(file)?.file];
        let pos = f
            .dims
            .iter()
            .position(|d| d.name == name)
            .ok_or(errno::DIM_NOT_FOUND)?;
        let d = &f.dims[pos];
        Ok(DimDesc {
            id: DimId(pos as i32),
            len: if d.unlimited { f.num_records } else { d.len },
            is_record: d.unlimited,
        })
    }

    fn inq_dim_len(&self, file: FileId, dim: DimId) -> BackendResult<(u64, bool)> {
        let store = self.store.lock().unwrap();
        let f = &store.files[store.handle(file)?.file];
        let d = f.dims.get(dim.0 as usize).ok_or(errno::DIM_NOT_FOUND)?;
        if d.unlimited {
            Ok((f.num_records, true))
        } else {
            Ok((d.len, false))
        }
    }

    fn inq_var(&self, file: FileId, name: &str) -> BackendResult<VarDesc> {
        let store = self.store.lock().unwrap();
        let f = &store.files[store.handle(file)?.file];
        let pos = f
            .vars
            .iter()
            .position(|v| v.name == name)
            .ok_or(errno::VAR_NOT_FOUND)?;
        let v = &f.vars[pos];
        Ok(VarDesc {
            id: VarId(pos as i32),
            vtype: v.vtype,
            dims: v.dims.iter().map(|&d| DimId(d as i32)).collect(),
        })
    }

    fn bput_vara(
        &self,
        file: FileId,
        var: VarId,
        start: &[u64],
        count: &[u64],
        buf: &[u8],
    ) -> BackendResult<ReqId> {
        let mut store = self.store.lock().unwrap();
        let req = store.next_req;
        store.next_req += 1;
        let handle = store.handle_mut(file)?;
        if handle.readonly {
            return Err(errno::READ_ONLY);
        }
        let cap = handle.cap.ok_or(errno::NO_BUFFER)?;
        let file_idx = handle.file;
        if buf.is_empty() {
            // Zero-size request: keeps ranks with nothing to write in
            // the collective schedule.
            let handle = store.handle_mut(file)?;
            handle.pending.push(PendingPut {
                req,
                var: var.0 as usize,
                start: start.to_vec(),
                count: count.to_vec(),
                data: Vec::new(),
            });
            store.files[file_idx].stats.bput_calls += 1;
            return Ok(ReqId(req));
        }
        if handle.usage + buf.len() as u64 > cap {
            return Err(errno::INSUFFICIENT_BUFFER);
        }
        // Requests may be posted in either mode (the API thread can
        // re-enter define mode while the writer is still draining);
        // they are committed by wait_all.
        let f = &store.files[file_idx];
        let v = f.vars.get(var.0 as usize).ok_or(errno::VAR_NOT_FOUND)?;
        check_access(v, start, count, buf.len())?;
        let handle = store.handle_mut(file)?;
        handle.usage += buf.len() as u64;
        handle.pending.push(PendingPut {
            req,
            var: var.0 as usize,
            start: start.to_vec(),
            count: count.to_vec(),
            data: buf.to_vec(),
        });
        store.files[file_idx].stats.bput_calls += 1;
        Ok(ReqId(req))
    }

    fn wait_all(&self, file: FileId, reqs: &[ReqId]) -> BackendResult<Vec<i32>> {
        let mut store = self.store.lock().unwrap();
        let handle = store.handle_mut(file)?;
        let file_idx = handle.file;
        let mut statuses = Vec::with_capacity(reqs.len());
        let mut to_apply = Vec::with_capacity(reqs.len());
        for r in reqs {
            match handle.pending.iter().position(|p| p.req == r.0) {
                Some(pos) => {
                    let put = handle.pending.remove(pos);
                    handle.usage -= put.data.len() as u64;
                    to_apply.push(put);
                    statuses.push(0);
                }
                None => statuses.push(errno::BAD_REQUEST),
            }
        }
        let flushed = to_apply.len() as u64;
        for put in to_apply {
            apply_put(&mut store.files[file_idx], put);
        }
        if !reqs.is_empty() {
            let stats = &mut store.files[file_idx].stats;
            stats.wait_all_calls += 1;
            stats.flushed_requests += flushed;
        }
        Ok(statuses)
    }

    fn get_vara(
        &self,
        file: FileId,
        var: VarId,
        start: &[u64],
        count: &[u64],
        buf: &mut [u8],
    ) -> BackendResult<()> {
        let store = self.store.lock().unwrap();
        let f = &store.files[store.handle(file)?.file];
        let v = f.vars.get(var.0 as usize).ok_or(errno::VAR_NOT_FOUND)?;
        if buf.is_empty() && count.iter().product::<u64>() == 0 {
            return Ok(());
        }
        check_access(v, start, count, buf.len())?;
        let es = v.vtype.size().unwrap_or(1);
        if v.record {
            let f0 = start[0];
            let inner_bytes =
                count[1..].iter().product::<u64>() as usize * es;
            for k in 0..count[0] {
                let frame = (f0 + k) as usize;
                let dst = &mut buf[k as usize * inner_bytes..(k as usize + 1) * inner_bytes];
                match v.frames.get(frame) {
                    Some(block) => read_slab(&v.inner_lens, &start[1..], &count[1..], es, block, dst),
                    // Unwritten frames read as fill (zeros).
                    None => dst.fill(0),
                }
            }
        } else {
            read_slab(&v.inner_lens, start, count, es, &v.frames[0], buf);
        }
        Ok(())
    }

    fn buffer_usage(&self, file: FileId) -> BackendResult<u64> {
        let store = self.store.lock().unwrap();
        Ok(store.handle(file)?.usage)
    }

    fn strerror(&self, errno_val: i32) -> String {
        match errno_val {
            errno::FILE_NOT_FOUND => "file not found".into(),
            errno::READ_ONLY => "write to read-only file".into(),
            errno::IN_DEFINE_MODE => "operation not allowed in define mode".into(),
            errno::NOT_IN_DEFINE_MODE => "operation not allowed in data mode".into(),
            errno::INVALID_COORDS => "index exceeds dimension bound".into(),
            errno::NAME_IN_USE => "name already in use".into(),
            errno::ATT_NOT_FOUND => "attribute not found".into(),
            errno::ONE_UNLIMITED => "only one unlimited dimension allowed".into(),
            errno::BAD_TYPE => "unknown variable type".into(),
            errno::DIM_NOT_FOUND => "dimension not found".into(),
            errno::RECORD_NOT_FIRST => "record dimension must be first".into(),
            errno::VAR_NOT_FOUND => "variable not found".into(),
            errno::BAD_ID => "not a valid file identifier".into(),
            errno::BAD_REQUEST => "not a valid request identifier".into(),
            errno::NO_BUFFER => "no buffer attached".into(),
            errno::INSUFFICIENT_BUFFER => "insufficient buffer space attached".into(),
            other => format!("unknown error {other}"),
        }
    }
}

/// Validate a hyperslab against the variable shape.
fn check_access(v: &MemVar, start: &[u64], count: &[u64], buf_len: usize) -> Result<(), i32> {
    let ndims = v.dims.len();
    if start.len() != ndims || count.len() != ndims {
        return Err(errno::INVALID_COORDS);
    }
    let es = v.vtype.size().unwrap_or(1);
    let expected = count.iter().product::<u64>() as usize * es;
    if expected != buf_len {
        return Err(errno::INVALID_COORDS);
    }
    let (fixed_start, fixed_count) = if v.record {
        (&start[1..], &count[1..])
    } else {
        (start, count)
    };
    for ((&s, &c), &len) in fixed_start
        .iter()
        .zip(fixed_count.iter())
        .zip(v.inner_lens.iter())
    {
        if s + c > len {
            return Err(errno::INVALID_COORDS);
        }
    }
    Ok(())
}

fn apply_put(file: &mut MemFile, put: PendingPut) {
    if put.data.is_empty() {
        return;
    }
    let v = &mut file.vars[put.var];
    let es = v.vtype.size().unwrap_or(1);
    if v.record {
        let f0 = put.start[0];
        let inner_bytes = put.count[1..].iter().product::<u64>() as usize * es;
        for k in 0..put.count[0] {
            let frame = (f0 + k) as usize;
            if v.frames.len() <= frame {
                v.frames.resize_with(frame + 1, || vec![0u8; v.frame_bytes]);
            }
            let src = &put.data[k as usize * inner_bytes..(k as usize + 1) * inner_bytes];
            write_slab(
                &v.inner_lens,
                &put.start[1..],
                &put.count[1..],
                es,
                &mut v.frames[frame],
                src,
            );
        }
        file.num_records = file.num_records.max(f0 + put.count[0]);
    } else {
        write_slab(&v.inner_lens, &put.start, &put.count, es, &mut v.frames[0], &put.data);
    }
}

/// Visit each contiguous row of the hyperslab as
/// `(block_byte_offset, buf_byte_offset, row_bytes)`.
fn for_each_row(
    lens: &[u64],
    start: &[u64],
    count: &[u64],
    es: usize,
    mut visit: impl FnMut(usize, usize, usize),
) {
    let n = lens.len();
    if count.iter().any(|&c| c == 0) {
        return;
    }
    if n == 0 {
        visit(0, 0, es);
        return;
    }
    let mut strides = vec![1u64; n];
    for i in (0..n.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * lens[i + 1];
    }
    let row = count[n - 1] as usize * es;
    let mut idx = vec![0u64; n - 1];
    let mut buf_pos = 0usize;
    loop {
        let mut off = start[n - 1];
        for i in 0..n - 1 {
            off += (start[i] + idx[i]) * strides[i];
        }
        visit(off as usize * es, buf_pos, row);
        buf_pos += row;

        let mut d = n as isize - 2;
        loop {
            if d < 0 {
                return;
            }
            idx[d as usize] += 1;
            if idx[d as usize] < count[d as usize] {
                break;
            }
            idx[d as usize] = 0;
            d -= 1;
        }
    }
}

fn write_slab(lens: &[u64], start: &[u64], count: &[u64], es: usize, block: &mut [u8], buf: &[u8]) {
    for_each_row(lens, start, count, es, |bo, uo, row| {
        block[bo..bo + row].copy_from_slice(&buf[uo..uo + row]);
    });
}

fn read_slab(lens: &[u64], start: &[u64], count: &[u64], es: usize, block: &[u8], buf: &mut [u8]) {
    for_each_row(lens, start, count, es, |bo, uo, row| {
        buf[uo..uo + row].copy_from_slice(&block[bo..bo + row]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_f64(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_define_and_roundtrip() {
        let be = MemBackend::new();
        let fid = be.create("a.nc").unwrap();
        be.attach_buffer(fid, 1 << 20).unwrap();
        let d = be.def_dim(fid, "n", Some(4)).unwrap();
        let v = be.def_var(fid, "x", VarType::Real64, &[d]).unwrap();
        be.enddef(fid).unwrap();

        let data = le_f64(&[1.0, 2.0, 3.0, 4.0]);
        let req = be.bput_vara(fid, v, &[0], &[4], &data).unwrap();
        assert_eq!(be.buffer_usage(fid).unwrap(), 32);
        assert_eq!(be.wait_all(fid, &[req]).unwrap(), vec![0]);
        assert_eq!(be.buffer_usage(fid).unwrap(), 0);

        let mut out = vec![0u8; 32];
        be.get_vara(fid, v, &[0], &[4], &mut out).unwrap();
        assert_eq!(out, data);
        be.close(fid).unwrap();
    }

    #[test]
    fn test_record_frames_grow_and_fill() {
        let be = MemBackend::new();
        let fid = be.create("rec.nc").unwrap();
        be.attach_buffer(fid, 1 << 20).unwrap();
        let t = be.def_dim(fid, "time", None).unwrap();
        let n = be.def_dim(fid, "n", Some(2)).unwrap();
        let v = be.def_var(fid, "x", VarType::Int32, &[t, n]).unwrap();
        be.enddef(fid).unwrap();

        let frame2: Vec<u8> = [7i32, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
        let req = be.bput_vara(fid, v, &[2, 0], &[1, 2], &frame2).unwrap();
        be.wait_all(fid, &[req]).unwrap();
        assert_eq!(be.inq_dim(fid, "time").unwrap().len, 3);

        // Frames 0 and 1 were never written: they read as fill.
        let mut out = vec![0xffu8; 8];
        be.get_vara(fid, v, &[0, 0], &[1, 2], &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        be.get_vara(fid, v, &[2, 0], &[1, 2], &mut out).unwrap();
        assert_eq!(out, frame2);
    }

    #[test]
    fn test_buffer_accounting_rejects_overflow() {
        let be = MemBackend::new();
        let fid = be.create("b.nc").unwrap();
        be.attach_buffer(fid, 16).unwrap();
        let d = be.def_dim(fid, "n", Some(8)).unwrap();
        let v = be.def_var(fid, "x", VarType::Char, &[d]).unwrap();
        be.enddef(fid).unwrap();

        let r1 = be.bput_vara(fid, v, &[0], &[8], &[1u8; 8]).unwrap();
        assert_eq!(
            be.bput_vara(fid, v, &[0], &[8], &[2u8; 8]).map(|_| ()),
            Ok(())
        );
        // 16 bytes pending; the next put no longer fits.
        assert_eq!(
            be.bput_vara(fid, v, &[0], &[8], &[3u8; 8]),
            Err(errno::INSUFFICIENT_BUFFER)
        );
        be.wait_all(fid, &[r1]).unwrap();
        assert!(be.bput_vara(fid, v, &[0], &[8], &[3u8; 8]).is_ok());
    }

    #[test]
    fn test_replicated_define_is_idempotent() {
        let be = MemBackend::new();
        let f1 = be.create("shared.nc").unwrap();
        let f2 = be.create("shared.nc").unwrap();
        let d1 = be.def_dim(f1, "n", Some(4)).unwrap();
        let d2 = be.def_dim(f2, "n", Some(4)).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(be.def_dim(f2, "n", Some(5)), Err(errno::NAME_IN_USE));
        let v1 = be.def_var(f1, "x", VarType::Real32, &[d1]).unwrap();
        // One rank may have left define mode already.
        be.enddef(f1).unwrap();
        let v2 = be.def_var(f2, "x", VarType::Real32, &[d2]).unwrap();
        assert_eq!(v1, v2);
        be.enddef(f2).unwrap();
    }

    #[test]
    fn test_error_texts() {
        let be = MemBackend::new();
        let fid = be.create("e.nc").unwrap();
        assert_eq!(be.inq_var(fid, "nope"), Err(errno::VAR_NOT_FOUND));
        assert_eq!(be.strerror(errno::VAR_NOT_FOUND), "variable not found");
        assert_eq!(be.open("missing.nc", true), Err(errno::FILE_NOT_FOUND));
        assert!(be.strerror(1234).contains("unknown error"));
    }

    #[test]
    fn test_zero_size_request() {
        let be = MemBackend::new();
        let fid = be.create("z.nc").unwrap();
        be.attach_buffer(fid, 64).unwrap();
        let d = be.def_dim(fid, "n", Some(4)).unwrap();
        let v = be.def_var(fid, "x", VarType::Int32, &[d]).unwrap();
        be.enddef(fid).unwrap();
        let req = be.bput_vara(fid, v, &[0], &[0], &[]).unwrap();
        assert_eq!(be.buffer_usage(fid).unwrap(), 0);
        assert_eq!(be.wait_all(fid, &[req]).unwrap(), vec![0]);
    }

    #[test]
    fn test_stats_counters() {
        let be = MemBackend::new();
        let fid = be.create("s.nc").unwrap();
        be.attach_buffer(fid, 1 << 20).unwrap();
        let d = be.def_dim(fid, "n", Some(1)).unwrap();
        let v = be.def_var(fid, "x", VarType::Char, &[d]).unwrap();
        be.enddef(fid).unwrap();
        let r1 = be.bput_vara(fid, v, &[0], &[1], &[1]).unwrap();
        let r2 = be.bput_vara(fid, v, &[0], &[1], &[2]).unwrap();
        be.wait_all(fid, &[r1, r2]).unwrap();
        let stats = be.stats("s.nc").unwrap();
        assert_eq!(stats.bput_calls, 2);
        assert_eq!(stats.wait_all_calls, 1);
        assert_eq!(stats.flushed_requests, 2);
    }
}
