//! slabio: a simple parallel I/O library for decomposed arrays.
//!
//! Compute ranks hold distributed slices of multi-dimensional arrays; a
//! strided subset of ranks (the I/O tasks) talks to a file backend with
//! buffered non-blocking puts. The library redistributes elements between
//! the two sides according to an immutable [`Decomp`], maintains the
//! define/data/frame state of each [`File`], and overlaps file output
//! with computation through a per-file background writer whose collective
//! schedule stays in lock-step across ranks.
//!
//! The transport ([`Comm`]) and the file backend ([`IoBackend`]) are
//! narrow traits: tests and single-node runs use the in-process threaded
//! transport plus an in-memory backend, production uses MPI (the `mpi`
//! feature) plus a parallel file-format library.

pub mod backend;
pub mod comm;
pub mod config;
pub mod context;
pub mod decomp;
pub mod error;
pub mod file;
mod queue;
mod ticket;
pub mod transfer;
pub mod vartype;
mod writer;

// Re-export primary types for convenience
pub use backend::{AttValue, BackendResult, DimDesc, DimId, FileId, IoBackend, ReqId, VarDesc, VarId};
pub use comm::threaded::ThreadComm;
pub use comm::{Comm, ReduceOp};
pub use config::Config;
pub use context::{BackendError, Context};
pub use decomp::{AggPlan, Aggregation, Decomp};
pub use error::{Error, Result, code, error_string};
pub use file::{DimInquiry, File, FileMode, FileState, MAX_NAME_LEN, VarInquiry};
pub use transfer::{Direction, transfer_field};
pub use vartype::VarType;

#[cfg(feature = "mpi")]
pub use comm::mpi::{MpiComm, comm_from_fortran};
