use std::fmt;
use std::io;

/// Errors returned by the connection pool.
#[derive(Debug)]
pub enum Error {
    /// Socket or epoll operation failed.
    Io(io::Error),
    /// No free connection slots available.
    AtCapacity,
    /// Relaying the shutdown token failed; workers can no longer be joined
    /// deterministically.
    ShutdownRelay(io::Error),
    /// A worker thread panicked before it could be joined.
    WorkerPanicked,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::AtCapacity => write!(f, "connection slots exhausted"),
            Error::ShutdownRelay(e) => write!(f, "shutdown relay failed: {e}"),
            Error::WorkerPanicked => write!(f, "worker thread panicked"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::ShutdownRelay(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
