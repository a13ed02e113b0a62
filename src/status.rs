//! Success-flag-plus-error-kind status value, and the byte-count-plus-status
//! I/O result type built on top of it.
//!
//! `Status` is the primary error channel for this crate's public API: every
//! fallible operation in the reactor, gateway, session, pool, and codec
//! returns `Result<T, Status>` rather than a generic boxed error, so callers
//! can match on `ErrorKind` instead of string-sniffing a message.

use std::fmt;

/// A symbolic error kind. Ordering here has no semantic meaning beyond
/// `Ok` being the only "success" variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok,
    OutOfMemory,
    TimedOut,
    LockFailed,
    IoError,
    EndOfStream,
    BadArgument,
    BadObject,
    LogicError,
    AccessDenied,
    Unimplemented,
    ShuttingDown,
    FileNotFound,
    Errno,
    SslError,
    TypeMismatch,
    DataNotFound,
}

impl ErrorKind {
    fn message(self) -> &'static str {
        match self {
            ErrorKind::Ok => "ok",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::LockFailed => "lock failed",
            ErrorKind::IoError => "I/O error",
            ErrorKind::EndOfStream => "end of stream",
            ErrorKind::BadArgument => "bad argument",
            ErrorKind::BadObject => "bad object",
            ErrorKind::LogicError => "logic error",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::ShuttingDown => "shutting down",
            ErrorKind::FileNotFound => "file not found",
            ErrorKind::Errno => "errno",
            ErrorKind::SslError => "SSL error",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::DataNotFound => "data not found",
        }
    }
}

/// A value type carrying a success flag plus (when unsuccessful) a symbolic
/// error kind. Two errors can be OR-combined, which keeps the first non-ok
/// kind seen; this lets callers sink several fallible sub-operations into
/// one final status without branching on each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(ErrorKind);

impl std::error::Error for Status {}

impl Status {
    pub const OK: Status = Status(ErrorKind::Ok);

    pub const fn new(kind: ErrorKind) -> Self {
        Status(kind)
    }

    pub const fn is_ok(self) -> bool {
        matches!(self.0, ErrorKind::Ok)
    }

    pub const fn is_error(self) -> bool {
        !self.is_ok()
    }

    pub const fn kind(self) -> ErrorKind {
        self.0
    }

    /// OR-combine: keeps `self` if it is already an error, otherwise takes
    /// `other`. Mirrors `status_t::operator|` in the original design.
    #[must_use]
    pub const fn or(self, other: Status) -> Status {
        if self.is_error() {
            self
        } else {
            other
        }
    }

    pub fn errno_wrapped(errno: i32) -> Status {
        let _ = errno;
        Status(ErrorKind::Errno)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.message())
    }
}

impl From<ErrorKind> for Status {
    fn from(kind: ErrorKind) -> Self {
        Status(kind)
    }
}

impl std::ops::BitOr for Status {
    type Output = Status;
    fn bitor(self, rhs: Status) -> Status {
        self.or(rhs)
    }
}

impl From<std::io::Error> for Status {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::TimedOut => ErrorKind::TimedOut,
            IoKind::UnexpectedEof => ErrorKind::EndOfStream,
            IoKind::NotFound => ErrorKind::FileNotFound,
            IoKind::PermissionDenied => ErrorKind::AccessDenied,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::BadArgument,
            _ => {
                if let Some(code) = e.raw_os_error() {
                    return Status::errno_wrapped(code);
                }
                ErrorKind::IoError
            }
        };
        Status(kind)
    }
}

/// A typed `Result` alias used throughout the crate.
pub type StatusResult<T> = Result<T, Status>;

/// Carries both a byte count and a status, so partial success plus error
/// (e.g. "wrote 5 bytes then failed") is representable without loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResult {
    bytes: u64,
    status: Status,
}

impl IoResult {
    pub const fn new(bytes: u64, status: Status) -> Self {
        IoResult { bytes, status }
    }

    pub const fn ok(bytes: u64) -> Self {
        IoResult::new(bytes, Status::OK)
    }

    pub const fn err(status: Status) -> Self {
        IoResult::new(0, status)
    }

    pub const fn byte_count(self) -> u64 {
        self.bytes
    }

    pub const fn status(self) -> Status {
        self.status
    }

    pub const fn is_error(self) -> bool {
        self.status.is_error()
    }
}
