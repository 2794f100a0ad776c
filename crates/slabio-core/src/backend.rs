//! File-backend abstraction.
//!
//! The backend is the parallel file-format layer underneath the library:
//! it must expose define-mode/data-mode switching, buffered non-blocking
//! puts with an explicit collective wait-all, and a fixed attached
//! buffer. Error codes are opaque integers owned by the backend and are
//! preserved verbatim when latched into the context; [`IoBackend::strerror`]
//! resolves them to text.
//!
//! Only I/O-task ranks hold open backend files; every trait method is
//! called on those ranks only.

use crate::vartype::VarType;

/// Identifies an open backend file on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

/// Backend dimension id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DimId(pub i32);

/// Backend variable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub i32);

/// Handle for one pending non-blocking put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub u64);

/// Result type for backend calls; the error is the backend's own errno.
pub type BackendResult<T> = std::result::Result<T, i32>;

/// Attribute payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AttValue {
    Text(String),
    Int32(i32),
    Real32(f32),
    Real64(f64),
}

/// Dimension description returned by [`IoBackend::inq_dim`].
#[derive(Debug, Clone, Copy)]
pub struct DimDesc {
    pub id: DimId,
    /// Current length; for the record dimension, the number of frames
    /// written so far.
    pub len: u64,
    pub is_record: bool,
}

/// Variable description returned by [`IoBackend::inq_var`].
#[derive(Debug, Clone, PartialEq)]
pub struct VarDesc {
    pub id: VarId,
    pub vtype: VarType,
    pub dims: Vec<DimId>,
}

/// The backend contract.
///
/// Each implementation performs its own fixed-switch translation between
/// [`VarType`] and its native type enum.
pub trait IoBackend: Send + Sync {
    /// Short backend name, latched alongside errnos (e.g. `"mem"`).
    fn kind(&self) -> &'static str;

    /// Create a new file, truncating any previous contents. Ranks
    /// opening the same path while it is already open attach to the
    /// same underlying file (a collective create).
    fn create(&self, path: &str) -> BackendResult<FileId>;

    /// Open an existing file.
    fn open(&self, path: &str, readonly: bool) -> BackendResult<FileId>;

    fn close(&self, file: FileId) -> BackendResult<()>;

    /// Attach the buffer that backs non-blocking buffered puts.
    fn attach_buffer(&self, file: FileId, bytes: u64) -> BackendResult<()>;

    fn detach_buffer(&self, file: FileId) -> BackendResult<()>;

    /// Re-enter define mode.
    fn redef(&self, file: FileId) -> BackendResult<()>;

    /// Leave define mode.
    fn enddef(&self, file: FileId) -> BackendResult<()>;

    /// Flush committed data.
    fn sync(&self, file: FileId) -> BackendResult<()>;

    /// Define a dimension; `None` length defines the record dimension.
    fn def_dim(&self, file: FileId, name: &str, len: Option<u64>) -> BackendResult<DimId>;

    fn def_var(
        &self,
        file: FileId,
        name: &str,
        vtype: VarType,
        dims: &[DimId],
    ) -> BackendResult<VarId>;

    /// Write an attribute; `var = None` addresses the file itself.
    fn put_att(
        &self,
        file: FileId,
        var: Option<VarId>,
        name: &str,
        value: &AttValue,
    ) -> BackendResult<()>;

    fn get_att(&self, file: FileId, var: Option<VarId>, name: &str) -> BackendResult<AttValue>;

    fn inq_dim(&self, file: FileId, name: &str) -> BackendResult<DimDesc>;

    /// Length and record-ness of a dimension by id.
    fn inq_dim_len(&self, file: FileId, dim: DimId) -> BackendResult<(u64, bool)>;

    fn inq_var(&self, file: FileId, name: &str) -> BackendResult<VarDesc>;

    /// Buffered non-blocking put of the hyperslab `start`/`count`.
    /// The bytes are copied into the attached buffer; the request is
    /// retired (and the buffer space reclaimed) by [`IoBackend::wait_all`].
    /// An empty `buf` records a zero-size request, which lets ranks with
    /// nothing to contribute stay in the collective schedule.
    fn bput_vara(
        &self,
        file: FileId,
        var: VarId,
        start: &[u64],
        count: &[u64],
        buf: &[u8],
    ) -> BackendResult<ReqId>;

    /// Retire pending puts. Returns one status per request, `0` on
    /// success; the call itself fails only when the file id is stale.
    fn wait_all(&self, file: FileId, reqs: &[ReqId]) -> BackendResult<Vec<i32>>;

    /// Synchronous read of the hyperslab `start`/`count` into `buf`.
    fn get_vara(
        &self,
        file: FileId,
        var: VarId,
        start: &[u64],
        count: &[u64],
        buf: &mut [u8],
    ) -> BackendResult<()>;

    /// Bytes of attached buffer currently consumed by pending puts.
    fn buffer_usage(&self, file: FileId) -> BackendResult<u64>;

    /// Resolve an errno to the backend's message text.
    fn strerror(&self, errno: i32) -> String;
}
