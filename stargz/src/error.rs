pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Archive is too small to hold a stargz footer ({0} bytes).")]
    TooSmall(u64),

    #[error("Invalid footer (the data that locates the table of contents is invalid): {0}")]
    InvalidFooter(&'static str),

    #[error("Could not find `{}` in the table of contents stream.", crate::TOC_TAR_NAME)]
    MissingToc,

    #[error("Invalid table of contents.")]
    InvalidToc(#[source] serde_json::Error),

    #[error("Entry not found in archive. Path: '{0}'")]
    NotFound(String),

    #[error("Entry is not a regular file. Path: '{0}'")]
    NotAFile(String),

    #[error("Invalid tar stream.")]
    InvalidTar(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn as_io_error(self) -> std::io::Error {
        use std::io::{Error as IoError, ErrorKind};
        match self {
            Error::Io(e) | Error::InvalidTar(e) => e,
            Error::NotFound(path) => {
                IoError::new(ErrorKind::NotFound, format!("entry not found in archive: {path}"))
            }
            other => IoError::new(ErrorKind::InvalidData, other.to_string()),
        }
    }
}
