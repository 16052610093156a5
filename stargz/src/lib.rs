//! Herein lies the `stargz` seekable tar.gz format.
//!
//! A stargz blob is an ordinary gzip-compressed tarball, except that every tar
//! header and every file chunk begins a fresh gzip member. A JSON table of
//! contents (`stargz.index.json`) and a fixed-size footer pointing at it are
//! appended, so individual files can be read without decompressing the whole
//! stream.
//!
//! Use [Reader][Reader] to read archives, and [Writer][Writer] to convert a tar
//! stream into one.

mod error;
mod footer;
pub mod io;
mod reader;
mod toc;
mod writer;

pub use error::{Error, Result};
pub use footer::{FOOTER_SIZE, footer_bytes, parse_footer};
pub use io::{ReadAt, SectionReader};
pub use reader::{Entry, FileReader, Reader, Stat};
pub use toc::{EntryId, EntryType, Toc, TocEntry};
pub use writer::Writer;

/// Name of the tar member holding the JSON table of contents.
pub const TOC_TAR_NAME: &str = "stargz.index.json";

/// Regular files larger than this are split into several independently
/// compressed chunks.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 << 20;
