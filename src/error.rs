//! Crate-wide error type.
//!
//! Mirrors the teacher's `Error`/`Errno` pair: a small closed set of error
//! kinds plus an optional static message, instead of `String`/`Box<dyn Error>`.

use std::fmt;

/// The kinds of errors the core can report, per the error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// The device adapter failed a read or write.
    IOError,
    /// The on-disk superblock is absent, has a bad signature, a version
    /// mismatch, or a structurally out-of-range field.
    FormatError,
    /// The caller passed an unaligned offset/length, an out-of-range BA,
    /// or called into the core after `close`.
    InvalidArgument,
    /// `seg_free_cnt` reached zero and the cleaner could not make progress.
    Exhausted,
    /// A lookup found no mapping (used internally; surfaces as a hole read).
    NotFound,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::IOError => "IOError",
            Errno::FormatError => "FormatError",
            Errno::InvalidArgument => "InvalidArgument",
            Errno::Exhausted => "Exhausted",
            Errno::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

/// A crate-wide error: an [`Errno`] plus an optional static message for
/// diagnostics. No error kind is recovered by retry at the core.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub fn new(errno: Errno) -> Self {
        Self { errno, msg: None }
    }

    pub fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Self {
            errno,
            msg: Some(msg),
        }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{}: {}", self.errno, msg),
            None => write!(f, "{}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

/// Shorthand for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Build and return an [`Error`] in one line, the way the teacher's
/// `return_errno_with_msg!` saves repeating `Error::with_msg` everywhere.
#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno:expr, $msg:expr) => {
        return Err($crate::Error::with_msg($errno, $msg))
    };
}
