//! Normalized error taxonomy for every operation the runtime performs.
//!
//! Raw syscall and resolver returns are translated into this closed set at
//! the OS shim boundary ([`crate::os`]); codes with no mapping become
//! [`Error::Unexpected`]. Per-operation failures are stored on the
//! [`Completion`](crate::completion::Completion) and surfaced through
//! `Completion::result`; they never abort the loop.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Normalized operation error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("access denied")]
    AccessDenied,
    #[error("permission denied")]
    PermissionDenied,
    #[error("symbolic link loop")]
    SymLinkLoop,
    #[error("process file descriptor quota exceeded")]
    ProcessFdQuotaExceeded,
    #[error("system file descriptor quota exceeded")]
    SystemFdQuotaExceeded,
    #[error("no such device")]
    NoDevice,
    #[error("file not found")]
    FileNotFound,
    #[error("name too long")]
    NameTooLong,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("file too big")]
    FileTooBig,
    #[error("is a directory")]
    IsDir,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("not a directory")]
    NotDir,
    #[error("path already exists")]
    PathAlreadyExists,
    #[error("device busy")]
    DeviceBusy,
    #[error("file busy")]
    FileBusy,
    #[error("bad path name")]
    BadPathName,
    #[error("operation would block")]
    WouldBlock,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("input/output error")]
    InputOutput,
    #[error("operation aborted")]
    OperationAborted,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("not open for reading")]
    NotOpenForReading,
    #[error("not open for writing")]
    NotOpenForWriting,
    #[error("disk quota exceeded")]
    DiskQuota,
    #[error("lock violation")]
    LockViolation,
    #[error("unknown host name")]
    UnknownHostName,
    #[error("temporary name server failure")]
    TemporaryNameServerFailure,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("service not available for socket type")]
    ServiceNotAvailableForSocketType,
    #[error("invalid flags")]
    InvalidFlags,
    #[error("permanent name server failure")]
    PermanentNameServerFailure,
    #[error("name has no usable address")]
    NameHasNoUsableAddress,
    #[error("operation canceled")]
    Canceled,
    #[error("no thread pool attached")]
    NoThreadPool,
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("unexpected system error")]
    Unexpected,
}
