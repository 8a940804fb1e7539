//! Error representation.

use rustix::io::Errno;
use std::io;

/// Errors produced by the transport layer.
///
/// Filesystem callbacks report failures as plain [`Errno`] values,
/// which travel back to the kernel inside the reply header. This
/// type covers the few conditions that concern the serve loop
/// itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel has closed the device and the filesystem is no
    /// longer mounted. This ends the serve loop without error.
    #[error("the filesystem is not mounted")]
    NotMounted,

    /// A device syscall was interrupted; the caller retries.
    #[error("interrupted system call")]
    Interrupted,

    /// Any other I/O failure on the device or during mount setup.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Translate a host I/O error into the errno reported to the kernel.
///
/// The raw OS error is passed through verbatim when present, so an
/// `Errno` that took a detour through `std::io::Error` survives
/// unchanged. Everything unrecognized degrades to `EIO`.
pub fn errno_from_io(err: &io::Error) -> Errno {
    if let Some(code) = err.raw_os_error() {
        return Errno::from_raw_os_error(code);
    }
    match err.kind() {
        io::ErrorKind::NotFound => Errno::NOENT,
        io::ErrorKind::AlreadyExists => Errno::EXIST,
        io::ErrorKind::PermissionDenied => Errno::ACCESS,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Errno::INVAL,
        io::ErrorKind::Interrupted => Errno::INTR,
        io::ErrorKind::TimedOut => Errno::TIMEDOUT,
        io::ErrorKind::WouldBlock => Errno::AGAIN,
        io::ErrorKind::BrokenPipe => Errno::PIPE,
        _ => Errno::IO,
    }
}
