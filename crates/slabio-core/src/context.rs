use std::sync::{Arc, Mutex};

use crate::comm::Comm;
use crate::config::Config;
use crate::error::{Error, Result};

/// Latched backend error detail.
///
/// The backend's errno is opaque to this library; the kind tag and the
/// resolved message let callers report it without knowing which backend
/// produced it.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub kind: &'static str,
    pub errno: i32,
    pub message: String,
}

/// Process-wide handle shared by files and decompositions.
///
/// Owns the duplicated parent communicator and the two derived
/// communicators: the I/O-task side split (all I/O ranks in one
/// communicator, all other ranks in another) and the I/O-group split
/// (each group holds one I/O rank plus the compute ranks it serves).
/// Both splits are keyed by rank, so the I/O rank is always rank 0 of
/// its group.
///
/// Never mutated after init except for the latched backend error.
pub struct Context {
    comm: Arc<dyn Comm>,
    io_comm: Arc<dyn Comm>,
    group_comm: Arc<dyn Comm>,
    rank: i32,
    size: i32,
    num_io_tasks: i32,
    io_stride: i32,
    is_io_task: bool,
    config: Config,
    backend_error: Mutex<Option<BackendError>>,
}

impl Context {
    /// Duplicate `parent` and derive the I/O-task and I/O-group
    /// communicators. Collective over `parent`.
    ///
    /// `n_io_tasks` of the strided ranks (`rank % stride == 0`) perform
    /// backend I/O; it must lie in `1..=ceil(size / stride)`.
    pub fn init(
        parent: &dyn Comm,
        n_io_tasks: i32,
        stride: i32,
        config: Config,
    ) -> Result<Arc<Context>> {
        if stride < 1 {
            return Err(Error::InvalidArgument("stride must be at least 1"));
        }
        let size = parent.size();
        let max_io_tasks = (size + stride - 1) / stride;
        if n_io_tasks < 1 || n_io_tasks > max_io_tasks {
            return Err(Error::InvalidArgument(
                "n_io_tasks out of range for communicator size and stride",
            ));
        }
        if config.n_reqs == 0 {
            return Err(Error::InvalidArgument("n_reqs must be at least 1"));
        }
        if config.buf_size == 0 {
            return Err(Error::InvalidArgument("buf_size must be at least 1"));
        }
        if config.agg_factor < 0 {
            return Err(Error::InvalidArgument("agg_factor must not be negative"));
        }

        let comm = parent.duplicate()?;
        let rank = comm.rank();
        let is_io_task = rank % stride == 0;
        // Key by rank so each side, and each group, lists ranks in
        // parent order; the I/O rank lands at group rank 0.
        let io_comm = comm.split(is_io_task as i32, rank)?;
        let group_comm = comm.split(rank / stride, rank)?;

        Ok(Arc::new(Context {
            comm,
            io_comm,
            group_comm,
            rank,
            size,
            num_io_tasks: n_io_tasks,
            io_stride: stride,
            is_io_task,
            config,
            backend_error: Mutex::new(None),
        }))
    }

    /// Release this reference to the context. Remaining clones (held by
    /// open files or decompositions) keep the communicators alive until
    /// they are dropped in turn.
    pub fn finalize(this: Arc<Context>) {
        drop(this);
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn is_io_task(&self) -> bool {
        self.is_io_task
    }

    pub fn num_io_tasks(&self) -> i32 {
        self.num_io_tasks
    }

    pub fn io_stride(&self) -> i32 {
        self.io_stride
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn comm(&self) -> &Arc<dyn Comm> {
        &self.comm
    }

    pub(crate) fn io_comm(&self) -> &Arc<dyn Comm> {
        &self.io_comm
    }

    pub(crate) fn group_comm(&self) -> &Arc<dyn Comm> {
        &self.group_comm
    }

    /// Latch a backend failure and produce the matching library error.
    /// Every rank of an I/O group latches the same (kind, errno) after
    /// the group broadcast, so all ranks decide identically.
    pub(crate) fn latch_backend_error(
        &self,
        kind: &'static str,
        errno: i32,
        message: String,
    ) -> Error {
        let mut slot = self.backend_error.lock().unwrap();
        *slot = Some(BackendError { kind, errno, message });
        Error::Library { kind, errno }
    }

    /// The most recent latched backend error, if any.
    pub fn last_backend_error(&self) -> Option<BackendError> {
        self.backend_error.lock().unwrap().clone()
    }

    /// Message text for the most recent latched backend error.
    pub fn lib_error_string(&self) -> Option<String> {
        self.backend_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::threaded::ThreadComm;
    use std::thread;

    fn with_world<F>(n: i32, f: F)
    where
        F: Fn(ThreadComm) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = ThreadComm::world(n)
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(comm))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_init_splits() {
        with_world(6, |comm| {
            let ctx = Context::init(&comm, 3, 2, Config::default()).unwrap();
            let rank = ctx.rank();
            assert_eq!(ctx.is_io_task(), rank % 2 == 0);
            // Three ranks on each side of the I/O split.
            assert_eq!(ctx.io_comm().size(), 3);
            // Groups of two, I/O rank first.
            assert_eq!(ctx.group_comm().size(), 2);
            assert_eq!(ctx.group_comm().rank(), rank % 2);
        });
    }

    #[test]
    fn test_init_rejects_bad_arguments() {
        with_world(1, |comm| {
            assert!(Context::init(&comm, 1, 0, Config::default()).is_err());
            assert!(Context::init(&comm, 0, 1, Config::default()).is_err());
            assert!(Context::init(&comm, 2, 1, Config::default()).is_err());
            let mut cfg = Config::default();
            cfg.n_reqs = 0;
            assert!(Context::init(&comm, 1, 1, cfg).is_err());
        });
    }

    #[test]
    fn test_latched_error() {
        with_world(1, |comm| {
            let ctx = Context::init(&comm, 1, 1, Config::default()).unwrap();
            assert!(ctx.lib_error_string().is_none());
            let err = ctx.latch_backend_error("mem", -49, "variable not found".into());
            assert_eq!(err.code(), crate::error::code::LIBRARY_ERROR);
            assert_eq!(ctx.lib_error_string().unwrap(), "variable not found");
            let latched = ctx.last_backend_error().unwrap();
            assert_eq!(latched.kind, "mem");
            assert_eq!(latched.errno, -49);
        });
    }
}
