use std::io;

use thiserror::Error;

/// Errors that can occur during database operations.
///
/// The set is closed: every failure an operation can report is one of these
/// variants. Key absence on a plain fetch is *not* an error — fetches return
/// `Ok(None)` — but [`Error::NotFound`] is used where absence refuses an
/// operation (conditional store, opening a missing file).
#[derive(Debug, Error)]
pub enum Error {
    /// A conditional store found the key already present.
    #[error("key already exists")]
    Exists,

    /// The key (or the file) was required to exist and did not.
    #[error("not found")]
    NotFound,

    /// A non-blocking lock acquisition failed, or a write was attempted
    /// through a handle that cannot take the write lock.
    #[error("locked")]
    Locked,

    /// A write was attempted on a read transaction.
    #[error("read-only")]
    ReadOnly,

    /// Magic, version, checksum engine, comparator, or a structural
    /// invariant check failed.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// A record checksum mismatched at the given file offset.
    #[error("bad checksum at offset {0}")]
    BadChecksum(u64),

    /// The caller misused the API (invalid flag combination, cursor
    /// finalised twice, and so on).
    #[error("bad usage: {0}")]
    BadUsage(&'static str),

    /// An underlying filesystem call failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An internal consistency assertion was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// An ebbkv Result returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Constructs an [`Error::BadFormat`] from a format string.
macro_rules! badformat {
    ($($args:tt)*) => {
        $crate::error::Error::BadFormat(format!($($args)*))
    };
}
pub(crate) use badformat;

/// Constructs an [`Error::Internal`] from a format string.
macro_rules! internal {
    ($($args:tt)*) => {
        $crate::error::Error::Internal(format!($($args)*))
    };
}
pub(crate) use internal;
