//! uringnet error types.

use std::fmt;

/// The failure taxonomy shared by every uringnet operation.
///
/// Raw OS errors are forwarded verbatim from kernel completion results as
/// `Os(errno)`. The remaining variants classify conditions the runtime
/// itself detects or synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Precondition violated by the caller: closed handle, bad endpoint,
    /// duplicate attach. Always returned synchronously, never through a
    /// callback.
    Invalid,
    /// Transient back-pressure. Triggers enqueueing, flow control changes,
    /// or retries; absorbed by the socket where possible.
    WouldBlock,
    /// The operation was cancelled, either explicitly or by socket
    /// shutdown. Terminal for that operation; exactly one callback fires.
    Cancelled,
    /// End of the receive direction, synthesized on receive-shutdown.
    Eof,
    /// The operation is unsupported on this kernel or transport.
    NotImplemented,
    /// The kernel refused an optional capability (e.g. zero-copy).
    NotAuthorized,
    /// A raw OS error, as a positive errno value.
    Os(i32),
}

impl Error {
    /// Classify a negative completion-queue result (`-errno`).
    pub fn from_raw_result(result: i32) -> Self {
        debug_assert!(result < 0);
        Self::from_errno(-result)
    }

    /// Classify a positive errno value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED => Error::Cancelled,
            libc::EAGAIN | libc::EINPROGRESS => Error::WouldBlock,
            libc::EINVAL | libc::EBADF | libc::ENOTSOCK => Error::Invalid,
            libc::ENOSYS | libc::EOPNOTSUPP => Error::NotImplemented,
            libc::EPERM | libc::EACCES => Error::NotAuthorized,
            other => Error::Os(other),
        }
    }

    /// Read the calling thread's errno and classify it.
    pub fn last_os_error() -> Self {
        Self::from_errno(unsafe { *libc::__errno_location() })
    }

    /// The underlying errno value, when one exists for this variant.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Invalid => Some(libc::EINVAL),
            Error::WouldBlock => Some(libc::EAGAIN),
            Error::Cancelled => Some(libc::ECANCELED),
            Error::Eof => None,
            Error::NotImplemented => Some(libc::ENOSYS),
            Error::NotAuthorized => Some(libc::EPERM),
            Error::Os(e) => Some(*e),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid => write!(f, "invalid argument"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Eof => write!(f, "end of stream"),
            Error::NotImplemented => write!(f, "not implemented"),
            Error::NotAuthorized => write!(f, "not authorized"),
            Error::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Error::Invalid,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_raw_result() {
        assert_eq!(Error::from_raw_result(-libc::ECANCELED), Error::Cancelled);
        assert_eq!(Error::from_raw_result(-libc::EAGAIN), Error::WouldBlock);
        assert_eq!(Error::from_raw_result(-libc::ENOSYS), Error::NotImplemented);
        assert_eq!(
            Error::from_raw_result(-libc::ECONNREFUSED),
            Error::Os(libc::ECONNREFUSED)
        );
    }

    #[test]
    fn test_errno_round_trip() {
        let e = Error::from_errno(libc::ECONNRESET);
        assert_eq!(e.errno(), Some(libc::ECONNRESET));
    }
}
