use std::path::PathBuf;

use libc::{EBADF, EINVAL, EIO, EISDIR, ENODATA, ENOENT, ENOTDIR};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No such file or directory")]
    NotFound,

    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("No such extended attribute `{0}`")]
    NoXattr(String),

    #[error("Not a directory")]
    NotDirectory,

    #[error("Is a directory")]
    IsDirectory,

    #[error("No open handle {0}")]
    BadHandle(u64),

    #[error("Cannot open layer `{}`", .path.display())]
    OpenLayer {
        path: PathBuf,
        #[source]
        source: stargz::Error,
    },

    #[error("Layer `{}` has no root directory", .path.display())]
    MissingRoot { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The error code reported back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => ENOENT,
            Error::InvalidOperation(_) => EINVAL,
            Error::NoXattr(_) => ENODATA,
            Error::NotDirectory => ENOTDIR,
            Error::IsDirectory => EISDIR,
            Error::BadHandle(_) => EBADF,
            Error::OpenLayer { source, .. } => match source {
                stargz::Error::Io(e) => io_errno(e),
                stargz::Error::NotFound(_) => ENOENT,
                _ => EIO,
            },
            Error::MissingRoot { .. } => EIO,
            Error::Io(e) => io_errno(e),
        }
    }
}

fn io_errno(e: &std::io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        std::io::ErrorKind::NotFound => ENOENT,
        std::io::ErrorKind::InvalidInput => EINVAL,
        _ => EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_host_codes() {
        assert_eq!(Error::NotFound.errno(), ENOENT);
        assert_eq!(Error::InvalidOperation("readlink").errno(), EINVAL);
        assert_eq!(Error::NoXattr("user.x".into()).errno(), ENODATA);
        assert_eq!(Error::BadHandle(9).errno(), EBADF);
        assert_eq!(
            Error::Io(std::io::Error::from_raw_os_error(libc::EACCES)).errno(),
            libc::EACCES
        );
        assert_eq!(
            Error::Io(std::io::ErrorKind::UnexpectedEof.into()).errno(),
            EIO
        );
    }

    #[test]
    fn layer_errors_keep_os_codes() {
        let missing = Error::OpenLayer {
            path: "gone.stargz".into(),
            source: stargz::Error::Io(std::io::Error::from_raw_os_error(ENOENT)),
        };
        assert_eq!(missing.errno(), ENOENT);

        let corrupt = Error::OpenLayer {
            path: "bad.stargz".into(),
            source: stargz::Error::TooSmall(3),
        };
        assert_eq!(corrupt.errno(), EIO);
    }
}
