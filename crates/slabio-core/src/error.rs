use thiserror::Error;

/// Stable integer error codes for foreign-language callers.
///
/// Every [`Error`] variant maps onto exactly one of these via
/// [`Error::code`]; `SUCCESS` is what a C wrapper returns when a call
/// produced no `Error` at all.
pub mod code {
    pub const SUCCESS: i32 = 0;
    pub const MALLOC_FAILURE: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const MPI_ERROR: i32 = 3;
    pub const FORTRAN_ERROR: i32 = 4;
    pub const LIBRARY_ERROR: i32 = 5;
    pub const WRONG_ARG_TYPE: i32 = 6;
    pub const INSUFFICIENT_ARG: i32 = 7;
    pub const ASYNC_ERROR: i32 = 8;
}

/// Library error type.
///
/// `Library` is a two-part code: it carries the backend kind and the
/// backend's own errno, and the full latched detail (including the
/// backend's message text) is available through
/// [`Context::lib_error_string`](crate::Context::lib_error_string).
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A checked allocation in the data pipeline failed.
    #[error("memory allocation failed")]
    MallocFailure,

    /// Invalid argument, detected locally with no transport traffic.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Transport failure, surfaced as-is; no recovery is attempted.
    #[error("transport error: {0}")]
    Mpi(String),

    /// A foreign-language handle could not be converted.
    #[error("invalid foreign communicator handle")]
    Fortran,

    /// The file backend reported an error (errno is opaque to this
    /// library; consult the context's latched error for the message).
    #[error("backend error ({kind} errno {errno})")]
    Library {
        kind: &'static str,
        errno: i32,
    },

    /// An argument had the wrong type for the requested operation.
    #[error("wrong argument type")]
    WrongArgType,

    /// An argument was too small for the requested operation.
    #[error("insufficient argument")]
    InsufficientArg,

    /// Background-worker setup or teardown failed.
    #[error("async worker error: {0}")]
    Async(&'static str),
}

impl Error {
    /// The stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::MallocFailure => code::MALLOC_FAILURE,
            Error::InvalidArgument(_) => code::INVALID_ARGUMENT,
            Error::Mpi(_) => code::MPI_ERROR,
            Error::Fortran => code::FORTRAN_ERROR,
            Error::Library { .. } => code::LIBRARY_ERROR,
            Error::WrongArgType => code::WRONG_ARG_TYPE,
            Error::InsufficientArg => code::INSUFFICIENT_ARG,
            Error::Async(_) => code::ASYNC_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Human-readable text for a stable integer code.
pub fn error_string(code_val: i32) -> &'static str {
    match code_val {
        code::SUCCESS => "success",
        code::MALLOC_FAILURE => "memory allocation failed",
        code::INVALID_ARGUMENT => "invalid argument",
        code::MPI_ERROR => "transport error",
        code::FORTRAN_ERROR => "invalid foreign communicator handle",
        code::LIBRARY_ERROR => "backend library error",
        code::WRONG_ARG_TYPE => "wrong argument type",
        code::INSUFFICIENT_ARG => "insufficient argument",
        code::ASYNC_ERROR => "async worker error",
        _ => "unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::MallocFailure.code(), 1);
        assert_eq!(Error::InvalidArgument("x").code(), 2);
        assert_eq!(Error::Mpi(String::new()).code(), 3);
        assert_eq!(Error::Fortran.code(), 4);
        assert_eq!(Error::Library { kind: "mem", errno: -1 }.code(), 5);
        assert_eq!(Error::WrongArgType.code(), 6);
        assert_eq!(Error::InsufficientArg.code(), 7);
        assert_eq!(Error::Async("x").code(), 8);
    }

    #[test]
    fn test_error_string_covers_all_codes() {
        for c in 0..=8 {
            assert_ne!(error_string(c), "unknown error code");
        }
        assert_eq!(error_string(99), "unknown error code");
    }
}
