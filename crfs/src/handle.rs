use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use stargz::{FileReader, ReadAt, Reader};

use crate::dir::DirEntry;
use crate::node::Node;
use crate::{Error, Result, lock};

/// A chunk's uncompressed byte range within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSpan {
    pub offset: u64,
    pub size: u64,
}

impl ChunkSpan {
    #[inline(always)]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[inline(always)]
    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }
}

/// Where an open file's bytes come from, one chunk at a time.
pub trait ChunkSource: Send + Sync {
    /// The chunk covering `offset`, if the file has one there.
    fn chunk_at(&self, offset: u64) -> Option<ChunkSpan>;

    /// The full contents of `span`.
    fn fetch(&self, span: ChunkSpan) -> io::Result<Vec<u8>>;
}

/// A regular file inside a stargz layer.
pub(crate) struct StargzFile {
    reader: Arc<Reader>,
    name: String,
    file: FileReader,
}

impl StargzFile {
    pub(crate) fn open(reader: &Arc<Reader>, name: &str) -> Result<StargzFile> {
        let file = reader.open_file(name).map_err(|e| match e {
            stargz::Error::NotFound(_) => Error::NotFound,
            stargz::Error::NotAFile(_) => Error::InvalidOperation("not a regular file"),
            other => Error::Io(other.as_io_error()),
        })?;
        Ok(StargzFile {
            reader: Arc::clone(reader),
            name: name.to_string(),
            file,
        })
    }
}

impl ChunkSource for StargzFile {
    fn chunk_at(&self, offset: u64) -> Option<ChunkSpan> {
        let chunk = self.reader.chunk_entry_for_offset(&self.name, offset)?;
        Some(ChunkSpan {
            offset: chunk.chunk_offset,
            size: chunk.chunk_size,
        })
    }

    fn fetch(&self, span: ChunkSpan) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; span.size as usize];
        self.file.read_exact_at(&mut buf, span.offset)?;
        Ok(buf)
    }
}

/// In-memory contents served as a single chunk.
pub(crate) struct StaticFile(pub(crate) &'static [u8]);

impl ChunkSource for StaticFile {
    fn chunk_at(&self, offset: u64) -> Option<ChunkSpan> {
        let span = ChunkSpan {
            offset: 0,
            size: self.0.len() as u64,
        };
        span.contains(offset).then_some(span)
    }

    fn fetch(&self, span: ChunkSpan) -> io::Result<Vec<u8>> {
        let start = span.offset as usize;
        let end = span.end() as usize;
        self.0
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
    }
}

struct CachedChunk {
    span: ChunkSpan,
    data: Arc<[u8]>,
}

/// An open file with a single-slot cache of the last chunk fetched.
///
/// The cache lock is not held while fetching, so overlapping reads on one
/// handle may fetch the same chunk twice; the slot itself is always consistent.
pub struct CachedFile {
    source: Box<dyn ChunkSource>,
    last: Mutex<Option<CachedChunk>>,
}

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last = lock(&self.last).as_ref().map(|c| c.span);
        f.debug_struct("CachedFile")
            .field("last", &last)
            .finish_non_exhaustive()
    }
}

impl CachedFile {
    pub fn new(source: impl ChunkSource + 'static) -> CachedFile {
        CachedFile {
            source: Box::new(source),
            last: Mutex::new(None),
        }
    }

    /// Read up to `size` bytes at `offset`. Returns fewer only at the end of
    /// the file or where no chunk covers the next byte.
    pub fn read(&self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size.min(1 << 20));

        while out.len() < size {
            let pos = offset + out.len() as u64;
            let Some(span) = self.source.chunk_at(pos) else {
                break;
            };
            if !span.contains(pos) {
                tracing::warn!(pos, ?span, "crfs: chunk does not cover requested offset");
                break;
            }

            let data = self.chunk(span)?;
            let start = (pos - span.offset) as usize;
            if start >= data.len() {
                break;
            }
            let n = (data.len() - start).min(size - out.len());
            out.extend_from_slice(&data[start..start + n]);
        }

        Ok(out)
    }

    fn chunk(&self, span: ChunkSpan) -> io::Result<Arc<[u8]>> {
        if let Some(hit) = lock(&self.last).as_ref().filter(|c| c.span == span) {
            tracing::trace!(offset = span.offset, size = span.size, "crfs: chunk cache hit");
            return Ok(Arc::clone(&hit.data));
        }

        tracing::trace!(offset = span.offset, size = span.size, "crfs: chunk cache miss");
        let data: Arc<[u8]> = self.source.fetch(span)?.into();
        *lock(&self.last) = Some(CachedChunk {
            span,
            data: Arc::clone(&data),
        });
        Ok(data)
    }
}

/// An opened node: a file with its chunk cache, or a directory with the
/// listing taken when it was first read.
#[derive(Debug)]
pub struct Handle {
    node: Arc<Node>,
    file: Option<CachedFile>,
    listing: OnceLock<Vec<DirEntry>>,
}

impl Handle {
    pub(crate) fn file(node: Arc<Node>, file: CachedFile) -> Handle {
        Handle {
            node,
            file: Some(file),
            listing: OnceLock::new(),
        }
    }

    pub(crate) fn directory(node: Arc<Node>) -> Handle {
        Handle {
            node,
            file: None,
            listing: OnceLock::new(),
        }
    }

    #[inline(always)]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    #[inline(always)]
    pub fn is_dir(&self) -> bool {
        self.file.is_none()
    }

    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let file = self.file.as_ref().ok_or(Error::IsDirectory)?;
        Ok(file.read(offset, size)?)
    }

    /// The directory listing, computed on first use and then kept for the
    /// life of the handle so offsets stay meaningful across calls.
    pub fn read_dir_all(&self) -> Result<&[DirEntry]> {
        if !self.is_dir() {
            return Err(Error::NotDirectory);
        }
        if let Some(listing) = self.listing.get() {
            return Ok(listing);
        }
        let listing = self.node.read_dir_all()?;
        Ok(self.listing.get_or_init(|| listing))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fixed-size chunks over `data`, counting fetches.
    struct Counting {
        data: Vec<u8>,
        chunk: u64,
        gap: Option<ChunkSpan>,
        fetches: Arc<AtomicUsize>,
    }

    impl Counting {
        fn new(data: &[u8], chunk: u64) -> (Counting, Arc<AtomicUsize>) {
            let fetches = Arc::new(AtomicUsize::new(0));
            let source = Counting {
                data: data.to_vec(),
                chunk,
                gap: None,
                fetches: Arc::clone(&fetches),
            };
            (source, fetches)
        }
    }

    impl ChunkSource for Counting {
        fn chunk_at(&self, offset: u64) -> Option<ChunkSpan> {
            let len = self.data.len() as u64;
            if offset >= len {
                return None;
            }
            let start = offset - offset % self.chunk;
            let span = ChunkSpan {
                offset: start,
                size: self.chunk.min(len - start),
            };
            match self.gap {
                Some(gap) if gap == span => None,
                _ => Some(span),
            }
        }

        fn fetch(&self, span: ChunkSpan) -> io::Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.data[span.offset as usize..span.end() as usize].to_vec())
        }
    }

    fn sample() -> Vec<u8> {
        (0..100u8).collect()
    }

    #[test]
    fn reads_match_source() {
        let data = sample();
        let (source, _) = Counting::new(&data, 7);
        let file = CachedFile::new(source);

        for (offset, size) in [(0, 100), (3, 10), (6, 2), (13, 30), (95, 20), (50, 1), (3, 10)] {
            let got = file.read(offset, size).unwrap();
            let end = (offset as usize + size).min(data.len());
            assert_eq!(got, &data[offset as usize..end], "offset {offset} size {size}");
        }
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let (source, fetches) = Counting::new(&sample(), 16);
        let file = CachedFile::new(source);

        assert_eq!(file.read(0, 4).unwrap(), [0u8, 1, 2, 3]);
        assert_eq!(file.read(4, 4).unwrap(), [4u8, 5, 6, 7]);
        assert_eq!(file.read(8, 8).unwrap(), (8..16).collect::<Vec<u8>>());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        assert_eq!(file.read(16, 1).unwrap(), [16u8]);
        assert_eq!(file.read(0, 1).unwrap(), [0u8]);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn end_of_file() {
        let (source, fetches) = Counting::new(&sample(), 10);
        let file = CachedFile::new(source);

        assert!(file.read(100, 10).unwrap().is_empty());
        assert!(file.read(1000, 10).unwrap().is_empty());
        assert_eq!(file.read(98, 10).unwrap(), [98u8, 99]);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stops_at_a_gap() {
        let (mut source, _) = Counting::new(&sample(), 10);
        source.gap = Some(ChunkSpan {
            offset: 20,
            size: 10,
        });
        let file = CachedFile::new(source);

        assert_eq!(file.read(15, 20).unwrap(), (15..20).collect::<Vec<u8>>());
        assert!(file.read(25, 5).unwrap().is_empty());
        assert_eq!(file.read(30, 2).unwrap(), [30u8, 31]);
    }

    #[test]
    fn concurrent_reads_stay_consistent() {
        let data = sample();
        let (source, _) = Counting::new(&data, 9);
        let file = CachedFile::new(source);

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let file = &file;
                let data = &data;
                s.spawn(move || {
                    for i in 0..200u64 {
                        let offset = (i * 13 + t * 7) % 100;
                        let got = file.read(offset, 11).unwrap();
                        let end = (offset as usize + 11).min(data.len());
                        assert_eq!(got, &data[offset as usize..end]);
                    }
                });
            }
        });
    }

    #[test]
    fn static_file_is_one_chunk() {
        let file = CachedFile::new(StaticFile(b"hello world"));
        assert_eq!(file.read(6, 100).unwrap(), b"world");
        assert!(file.read(11, 1).unwrap().is_empty());
    }
}
