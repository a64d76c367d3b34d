use std::fmt;
use std::io;

/// Errors returned by axle's fallible construction and launch paths.
///
/// Runtime I/O trouble on established connections is not surfaced through
/// this type; the loop absorbs transient errors and drives fatal ones
/// through the connection close path.
#[derive(Debug)]
pub enum Error {
    /// Underlying syscall or socket operation failed.
    Io(io::Error),
    /// An address string could not be parsed or resolved.
    InvalidAddress(String),
    /// Spawning an event-loop thread failed.
    ThreadSpawn(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(s) => write!(f, "invalid address: {s}"),
            Error::ThreadSpawn(e) => write!(f, "thread spawn: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_address() {
        let err = Error::InvalidAddress("nowhere:0".into());
        assert_eq!(err.to_string(), "invalid address: nowhere:0");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = Error::from(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert!(err.to_string().starts_with("I/O error"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
