//! Error kinds shared by all layers.
//!
//! Each layer reports failures with its own error type, but every one of them
//! can be classified into an `ErrorKind`. The kind tells the caller what to do
//! about the failure: fix its setup, drop the current unit of work and retry
//! later, or give up on the call.
use nix::errno::Errno;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required collaborator is missing or the setup is inconsistent. Fatal
    /// to the session that reports it.
    Configuration,
    /// No buffer is currently available. Recoverable: drop the current frame
    /// and retry on the next cycle.
    ResourceExhausted,
    /// The device rejected or failed an operation.
    Device,
    /// A caller passed an invalid value. Nothing has been changed.
    InvalidArgument,
}

impl ErrorKind {
    /// Whether the failed unit of work can simply be retried later.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::ResourceExhausted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::ResourceExhausted => "no free buffer",
            ErrorKind::Device => "device error",
            ErrorKind::InvalidArgument => "invalid argument",
        })
    }
}

impl From<ErrorKind> for Errno {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Configuration => Errno::ENODEV,
            ErrorKind::ResourceExhausted => Errno::EAGAIN,
            ErrorKind::Device => Errno::EIO,
            ErrorKind::InvalidArgument => Errno::EINVAL,
        }
    }
}

impl From<Errno> for ErrorKind {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENODEV | Errno::ENOENT | Errno::ENXIO => ErrorKind::Configuration,
            Errno::EAGAIN | Errno::ENOMEM | Errno::ENOBUFS => ErrorKind::ResourceExhausted,
            Errno::EINVAL | Errno::ERANGE | Errno::EFAULT => ErrorKind::InvalidArgument,
            _ => ErrorKind::Device,
        }
    }
}
