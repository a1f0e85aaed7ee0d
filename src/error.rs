use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::option::Ipv6Option;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the option binding layer.
///
/// Every OS failure is reflected back to the caller; nothing is retried or
/// swallowed here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid socket handle")]
    InvalidHandle,

    #[error("{0} is not supported on this socket or platform")]
    UnsupportedOption(String),

    #[error("invalid value for {option}: {reason}")]
    InvalidValue { option: String, reason: String },

    #[error("not an IPv6 socket")]
    NotIpv6,

    #[error("os error: {0}")]
    Os(Errno),
}

impl Error {
    pub(crate) fn unsupported(option: Ipv6Option) -> Self {
        Error::UnsupportedOption(option.to_string())
    }

    pub(crate) fn invalid_value(option: Ipv6Option, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            option: option.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify an errno returned by `getsockopt`/`setsockopt` for `option`.
    ///
    /// `EINVAL` only means a bad value when we were writing one.
    pub(crate) fn from_errno(errno: Errno, option: Ipv6Option, writing: bool) -> Self {
        match errno {
            Errno::EBADF | Errno::ENOTSOCK => Error::InvalidHandle,
            Errno::ENOPROTOOPT | Errno::EOPNOTSUPP => Error::unsupported(option),
            Errno::EINVAL if writing => Error::invalid_value(option, "rejected by the kernel"),
            other => Error::Os(other),
        }
    }

    /// The raw OS error code, if this error came straight from the OS.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Os(errno) => Some(*errno as i32),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            // keep the raw code so `WouldBlock` and friends survive the conversion
            Error::Os(errno) => io::Error::from(errno),
            Error::InvalidHandle => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::InvalidValue { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::UnsupportedOption(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            Error::NotIpv6 => io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    }
}
