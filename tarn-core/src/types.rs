// vim: tw=80
//! Common type definitions used throughout tarn

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Tarn's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq, Primitive)]
pub enum Error {
    #[error("Operation not permitted")]
    EPERM       = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT      = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR       = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO         = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO       = libc::ENXIO as isize,
    #[error("Bad file descriptor")]
    EBADF       = libc::EBADF as isize,
    #[error("Cannot allocate memory")]
    ENOMEM      = libc::ENOMEM as isize,
    #[error("Permission denied")]
    EACCES      = libc::EACCES as isize,
    #[error("Device busy")]
    EBUSY       = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST      = libc::EEXIST as isize,
    #[error("Operation not supported by device")]
    ENODEV      = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL      = libc::EINVAL as isize,
    #[error("File too large")]
    EFBIG       = libc::EFBIG as isize,
    #[error("No space left on device")]
    ENOSPC      = libc::ENOSPC as isize,
    #[error("Read-only file system")]
    EROFS       = libc::EROFS as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN      = libc::EAGAIN as isize,
    #[error("Operation not supported")]
    ENOTSUP     = libc::EOPNOTSUPP as isize,
    #[error("Operation timed out")]
    ETIMEDOUT   = libc::ETIMEDOUT as isize,
    #[error("Value too large to be stored in data type")]
    EOVERFLOW   = libc::EOVERFLOW as isize,
    #[error("Operation canceled")]
    ECANCELED   = libc::ECANCELED as isize,
    #[error("Bad message")]
    EBADMSG     = libc::EBADMSG as isize,

    //// Tarn custom error types below
    #[error("Unknown error")]
    EUNKNOWN    = 256,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// 64-bit on-disk identity of a pool or of a device within a pool.
///
/// Zero means "unknown": freshly formatted devices have no identity until
/// their first label is written.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct Guid(pub u64);

impl Guid {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Guid {
    fn from(g: u64) -> Self {
        Guid(g)
    }
}

// LCOV_EXCL_STOP
