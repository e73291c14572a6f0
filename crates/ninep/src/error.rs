//! Define 9P error representations.
//!
//! In 9P2000, errors cross the wire as strings carried by an `RError`
//! response. Inside the library they are carried as errnos or I/O errors
//! and rendered to the classic Plan 9 phrasing at the protocol boundary.

use std::io::ErrorKind::*;
use std::{fmt, io};

use nix::errno::Errno;

fn errno_from_ioerror(e: &io::Error) -> Errno {
    e.raw_os_error()
        .map(Errno::from_raw)
        .unwrap_or(match e.kind() {
            NotFound => Errno::ENOENT,
            PermissionDenied => Errno::EPERM,
            ConnectionRefused => Errno::ECONNREFUSED,
            ConnectionReset => Errno::ECONNRESET,
            ConnectionAborted => Errno::ECONNABORTED,
            NotConnected => Errno::ENOTCONN,
            AddrInUse => Errno::EADDRINUSE,
            AddrNotAvailable => Errno::EADDRNOTAVAIL,
            BrokenPipe => Errno::EPIPE,
            AlreadyExists => Errno::EEXIST,
            WouldBlock => Errno::EAGAIN,
            InvalidInput => Errno::EINVAL,
            InvalidData => Errno::EPROTO,
            TimedOut => Errno::ETIMEDOUT,
            Interrupted => Errno::EINTR,
            UnexpectedEof => Errno::ECONNRESET,
            _ => Errno::EIO,
        })
}

/// 9P error type which is convertible to an error string.
///
/// The value of `Error::ename()` will be used for RError.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno
    No(Errno),
    /// I/O error
    Io(io::Error),
    /// Error string returned by the server in an `RError` response
    Remote(String),
}

impl Error {
    /// Get an errno representation
    pub fn errno(&self) -> Errno {
        match *self {
            Error::No(e) => e,
            Error::Io(ref e) => errno_from_ioerror(e),
            Error::Remote(_) => Errno::EREMOTEIO,
        }
    }

    /// The string which an `RError` response carries for this error
    pub fn ename(&self) -> String {
        match *self {
            Error::No(e) => string::from_errno(e).to_owned(),
            Error::Io(ref e) => e.to_string(),
            Error::Remote(ref s) => s.clone(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(e) => write!(f, "{}", e.desc()),
            Error::Io(ref e) => write!(f, "{}", e),
            Error::Remote(ref s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e)
    }
}

/// Errno, error numbers
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P error strings
///
/// The classic phrasings used by Plan 9 file servers, keyed by the errno
/// the library carries internally.
pub mod string {
    use nix::errno::Errno;

    pub const EPERM: &str = "permission denied";
    pub const ENOENT: &str = "file not found";
    pub const EIO: &str = "i/o error";
    pub const EBADF: &str = "fid unknown or out of range";
    pub const EACCES: &str = "permission denied";
    pub const EEXIST: &str = "file already exists";
    pub const ENOTDIR: &str = "not a directory";
    pub const EINVAL: &str = "illegal mode";
    pub const ENOTEMPTY: &str = "directory is not empty";
    pub const EOPNOTSUPP: &str = "operation not supported";
    pub const ENAMETOOLONG: &str = "illegal name";
    pub const EPROTO: &str = "protocol botch";

    pub fn from_errno(e: Errno) -> &'static str {
        match e {
            Errno::EPERM => EPERM,
            Errno::ENOENT => ENOENT,
            Errno::EIO => EIO,
            Errno::EBADF => EBADF,
            Errno::EACCES => EACCES,
            Errno::EEXIST => EEXIST,
            Errno::ENOTDIR => ENOTDIR,
            Errno::EINVAL => EINVAL,
            Errno::ENOTEMPTY => ENOTEMPTY,
            Errno::EOPNOTSUPP => EOPNOTSUPP,
            Errno::ENAMETOOLONG => ENAMETOOLONG,
            Errno::EPROTO => EPROTO,
            _ => e.desc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ename_uses_plan9_phrasing() {
        assert_eq!(Error::No(Errno::ENOENT).ename(), "file not found");
        assert_eq!(Error::No(Errno::EBADF).ename(), "fid unknown or out of range");
    }

    #[test]
    fn remote_errors_pass_through() {
        let e = Error::Remote("no such device".to_owned());
        assert_eq!(e.ename(), "no such device");
        assert_eq!(e.errno(), Errno::EREMOTEIO);
    }

    #[test]
    fn io_errors_map_to_errno() {
        let e = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.errno(), Errno::ENOENT);
    }
}
