//! Error types for the strand fiber runtime

use core::fmt;

/// Result type for fiber operations
pub type FiberResult<T> = Result<T, Error>;

/// Failures surfaced by fiber primitives and the HTTP adapter.
///
/// Every fiber carries one diagnostic slot; a failing primitive stores the
/// error there and returns it. `join` moves the joined fiber's terminal
/// diagnostic into the joiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An allocator refused a request
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// What the allocation was for
        object: &'static str,
    },

    /// A deadline passed before the operation completed
    TimedOut,

    /// API misuse (wrong request mode, malformed header, bad argument)
    IllegalParams(String),

    /// OS or transport failure
    SystemError {
        /// errno-style code, when known
        errno: i32,
        /// Human-readable description
        msg: String,
    },

    /// The fiber was cancelled cooperatively
    FiberIsCancelled,

    /// A failure raised from a fiber body (including caught panics)
    Exception(String),
}

impl Error {
    /// Check whether this is a cancellation
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::FiberIsCancelled)
    }

    /// Check whether this is a deadline expiry
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Short tag identifying the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::OutOfMemory { .. } => "OutOfMemory",
            Error::TimedOut => "TimedOut",
            Error::IllegalParams(_) => "IllegalParams",
            Error::SystemError { .. } => "SystemError",
            Error::FiberIsCancelled => "FiberIsCancelled",
            Error::Exception(_) => "Exception",
        }
    }

    /// Build a `SystemError` from the current OS errno
    pub fn from_errno(msg: &str) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        Error::SystemError {
            errno,
            msg: msg.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory { requested, object } => {
                write!(f, "failed to allocate {} bytes for {}", requested, object)
            }
            Error::TimedOut => write!(f, "timed out"),
            Error::IllegalParams(msg) => write!(f, "illegal params: {}", msg),
            Error::SystemError { errno, msg } => {
                write!(f, "system error (errno {}): {}", errno, msg)
            }
            Error::FiberIsCancelled => write!(f, "fiber is cancelled"),
            Error::Exception(msg) => write!(f, "exception: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::SystemError {
            errno: e.raw_os_error().unwrap_or(0),
            msg: e.to_string(),
        }
    }
}
