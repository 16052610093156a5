use std::collections::HashMap;
use std::io::{self, Read};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;

use crate::footer::{FOOTER_SIZE, parse_footer};
use crate::io::{ReadAt, SectionReader};
use crate::toc::{EntryId, EntryType, Toc, TocEntry};
use crate::{Error, Result, TOC_TAR_NAME};

/// An opened stargz archive with its table of contents indexed.
///
/// Entries are immutable once the reader is built and live as long as it does.
pub struct Reader {
    source: Box<dyn ReadAt + Send + Sync>,
    size: u64,
    toc_offset: u64,
    /// Keyed by [EntryId]. Slot 0 is always the root directory.
    entries: Vec<TocEntry>,
    /// Cleaned path to entry. Hardlink names point at their target.
    names: HashMap<String, EntryId>,
    /// Chunks of each regular file ordered by `chunk_offset`. The first chunk
    /// is the `reg` entry itself.
    chunks: HashMap<EntryId, Vec<EntryId>>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("size", &self.size)
            .field("toc_offset", &self.toc_offset)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Metadata summary of an entry, in the shape of `stat(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    /// Permission bits plus file type bits.
    pub mode: u32,
    pub mod_time: SystemTime,
}

/// A borrowed view of one table of contents entry, able to walk to its children.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    reader: &'a Reader,
    entry: &'a TocEntry,
}

impl std::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.entry.fmt(f)
    }
}

impl<'a> Deref for Entry<'a> {
    type Target = TocEntry;

    #[inline(always)]
    fn deref(&self) -> &TocEntry {
        self.entry
    }
}

impl<'a> Entry<'a> {
    #[inline(always)]
    pub fn toc(&self) -> &'a TocEntry {
        self.entry
    }

    /// Find a direct child by its base name.
    pub fn lookup_child(&self, name: &str) -> Option<Entry<'a>> {
        let id = *self.entry.children.get(name)?;
        self.reader.entry(id)
    }

    /// Direct children in name order. Stop iterating to end the walk early.
    pub fn children(&self) -> impl Iterator<Item = (&'a str, Entry<'a>)> + 'a {
        let reader = self.reader;
        self.entry
            .children
            .iter()
            .map(move |(name, id)| (name.as_str(), reader.entry_at(*id)))
    }

    #[inline(always)]
    pub fn child_count(&self) -> usize {
        self.entry.children.len()
    }

    pub fn stat(&self) -> Stat {
        Stat {
            size: self.entry.size,
            mode: self.entry.full_mode(),
            mod_time: self
                .entry
                .mod_time
                .map(SystemTime::from)
                .unwrap_or(UNIX_EPOCH),
        }
    }
}

fn clean_name(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts.join("/")
}

fn split_parent(name: &str) -> (&str, &str) {
    name.rsplit_once('/').unwrap_or(("", name))
}

fn read_toc<R: ReadAt + ?Sized>(source: &R, offset: u64, len: u64) -> Result<Toc> {
    let section = SectionReader::new(source, offset, len);
    let mut archive = tar::Archive::new(GzDecoder::new(section));

    for entry in archive.entries().map_err(Error::InvalidTar)? {
        let entry = entry.map_err(Error::InvalidTar)?;
        let is_toc = entry.path().map_err(Error::InvalidTar)?.as_ref() == Path::new(TOC_TAR_NAME);
        if is_toc {
            return serde_json::from_reader(entry).map_err(Error::InvalidToc);
        }
    }

    Err(Error::MissingToc)
}

impl Reader {
    /// Open an archive of `size` bytes, validating its footer and loading the
    /// table of contents.
    pub fn open<R: ReadAt + Send + Sync + 'static>(source: R, size: u64) -> Result<Reader> {
        if size < FOOTER_SIZE {
            return Err(Error::TooSmall(size));
        }

        let footer_offset = size - FOOTER_SIZE;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        source.read_exact_at(&mut footer, footer_offset)?;
        let toc_offset = parse_footer(&footer)?;
        if toc_offset >= footer_offset {
            return Err(Error::InvalidFooter("table of contents offset out of range"));
        }

        let toc = read_toc(&source, toc_offset, footer_offset - toc_offset)?;
        tracing::debug!(
            size,
            toc_offset,
            entries = toc.entries.len(),
            "stargz: loaded table of contents"
        );

        Ok(Self::from_toc(Box::new(source), size, toc_offset, toc))
    }

    /// Open a local archive file.
    #[cfg(unix)]
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Reader> {
        let file = std::fs::File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        Self::open(file, size)
    }

    fn from_toc(
        source: Box<dyn ReadAt + Send + Sync>,
        size: u64,
        toc_offset: u64,
        toc: Toc,
    ) -> Reader {
        let mut reader = Reader {
            source,
            size,
            toc_offset,
            entries: Vec::with_capacity(toc.entries.len() + 1),
            names: HashMap::with_capacity(toc.entries.len() + 1),
            chunks: HashMap::new(),
        };
        reader.index(toc.entries);
        reader
    }

    fn index(&mut self, raw: Vec<TocEntry>) {
        let root = self.push(TocEntry {
            kind: EntryType::Dir,
            mode: 0o755,
            ..Default::default()
        });
        self.names.insert(String::new(), root);

        let mut last_reg: Option<EntryId> = None;

        for mut ent in raw {
            ent.name = clean_name(&ent.name);

            match ent.kind {
                EntryType::Chunk => {
                    let Some(reg) = last_reg else {
                        tracing::warn!(offset = ent.offset, "stargz: chunk without a file, ignored");
                        continue;
                    };
                    let file = &self.entries[reg.index()];
                    ent.name = file.name.clone();
                    if ent.chunk_size == 0 {
                        ent.chunk_size = file.size.saturating_sub(ent.chunk_offset);
                    }
                    let id = self.push(ent);
                    self.chunks.entry(reg).or_default().push(id);
                }
                EntryType::Hardlink => {
                    let target = clean_name(&ent.link_name);
                    match self.names.get(&target).copied() {
                        Some(target) => {
                            self.entries[target.index()].num_link += 1;
                            self.names.insert(ent.name.clone(), target);
                            self.attach(&ent.name, target);
                        }
                        None => {
                            tracing::warn!(
                                name = %ent.name,
                                target = %target,
                                "stargz: hardlink to unknown entry, ignored"
                            );
                        }
                    }
                }
                EntryType::Dir => match self.names.get(&ent.name).copied() {
                    Some(existing) if self.entries[existing.index()].is_dir() => {
                        // Explicit metadata for a directory that was already
                        // synthesized as some child's parent.
                        let slot = &mut self.entries[existing.index()];
                        ent.id = existing;
                        ent.children = std::mem::take(&mut slot.children);
                        *slot = ent;
                    }
                    _ => {
                        let name = ent.name.clone();
                        let id = self.push(ent);
                        self.names.insert(name.clone(), id);
                        self.attach(&name, id);
                    }
                },
                kind => {
                    if kind == EntryType::Reg && ent.chunk_size == 0 {
                        ent.chunk_size = ent.size;
                    }
                    let name = ent.name.clone();
                    let id = self.push(ent);
                    self.names.insert(name.clone(), id);
                    self.attach(&name, id);
                    if kind == EntryType::Reg {
                        last_reg = Some(id);
                        self.chunks.insert(id, vec![id]);
                    }
                }
            }
        }

        let mut next = self.toc_offset;
        for ent in self.entries.iter_mut().rev() {
            if ent.is_data_type() {
                ent.next_offset = next;
            }
            if ent.offset != 0 {
                next = ent.offset;
            }
        }

        for index in 0..self.entries.len() {
            if !self.entries[index].is_dir() {
                continue;
            }
            let subdirs = self.entries[index]
                .children
                .values()
                .filter(|child| self.entries[child.index()].is_dir())
                .count() as u32;
            self.entries[index].num_link = 2 + subdirs;
        }

        for chunks in self.chunks.values_mut() {
            let entries = &self.entries;
            chunks.sort_by_key(|id| entries[id.index()].chunk_offset);
        }
    }

    fn push(&mut self, mut ent: TocEntry) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        ent.id = id;
        if ent.num_link == 0 {
            ent.num_link = 1;
        }
        self.entries.push(ent);
        id
    }

    /// Register `id` under its parent directory, synthesizing missing parents.
    fn attach(&mut self, name: &str, id: EntryId) {
        if name.is_empty() {
            return;
        }
        let (parent, base) = split_parent(name);
        let parent = self.dir_for(parent);
        self.entries[parent.index()]
            .children
            .insert(base.to_string(), id);
    }

    fn dir_for(&mut self, name: &str) -> EntryId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = self.push(TocEntry {
            name: name.to_string(),
            kind: EntryType::Dir,
            mode: 0o755,
            ..Default::default()
        });
        self.names.insert(name.to_string(), id);
        self.attach(name, id);
        id
    }

    #[inline(always)]
    fn entry_at(&self, id: EntryId) -> Entry<'_> {
        Entry {
            reader: self,
            entry: &self.entries[id.index()],
        }
    }

    /// Total compressed size of the archive.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline(always)]
    pub fn toc_offset(&self) -> u64 {
        self.toc_offset
    }

    /// The root directory entry. Always present in a successfully opened archive.
    pub fn root(&self) -> Option<Entry<'_>> {
        self.lookup("")
    }

    pub fn lookup(&self, path: &str) -> Option<Entry<'_>> {
        let id = *self.names.get(&clean_name(path))?;
        self.entry(id)
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry<'_>> {
        self.entries.get(id.index()).map(|entry| Entry {
            reader: self,
            entry,
        })
    }

    /// Every entry in table order, excluding chunk continuations.
    pub fn iter(&self) -> impl Iterator<Item = Entry<'_>> {
        self.entries
            .iter()
            .filter(|entry| entry.kind != EntryType::Chunk)
            .map(move |entry| Entry {
                reader: self,
                entry,
            })
    }

    /// The chunk of regular file `path` whose uncompressed range covers `offset`.
    pub fn chunk_entry_for_offset(&self, path: &str, offset: u64) -> Option<Entry<'_>> {
        let file = self.lookup(path)?;
        self.chunk_for(file.id(), offset).map(|entry| Entry {
            reader: self,
            entry,
        })
    }

    fn chunk_for(&self, file: EntryId, offset: u64) -> Option<&TocEntry> {
        let ent = &self.entries[file.index()];
        if ent.kind != EntryType::Reg || offset >= ent.size {
            return None;
        }
        let chunks = self.chunks.get(&file)?;
        let after = chunks.partition_point(|id| self.entries[id.index()].chunk_offset <= offset);
        let chunk = &self.entries[chunks[after.checked_sub(1)?].index()];
        if offset >= chunk.chunk_offset + chunk.chunk_size {
            return None;
        }
        Some(chunk)
    }

    /// Open the decompressed contents of regular file `path` for positional reads.
    pub fn open_file(self: &Arc<Self>, path: &str) -> Result<FileReader> {
        let ent = self
            .lookup(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if ent.kind != EntryType::Reg {
            return Err(Error::NotAFile(path.to_string()));
        }
        Ok(FileReader {
            reader: Arc::clone(self),
            file: ent.id(),
            size: ent.size,
        })
    }

    /// Decompress `buf.len()` bytes of `chunk`, starting `skip` bytes into it.
    fn read_chunk(&self, chunk: &TocEntry, skip: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = chunk.next_offset.saturating_sub(chunk.offset);
        let section = SectionReader::new(&*self.source, chunk.offset, len);
        let mut gz = GzDecoder::new(section);

        let skipped = io::copy(&mut (&mut gz).take(skip), &mut io::sink())?;
        if skipped != skip {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunk of `{}` ended early", chunk.name),
            ));
        }

        let mut filled = 0;
        while filled < buf.len() {
            match gz.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// Positional reader over one regular file's decompressed contents.
///
/// Each read decompresses only the chunks that cover the requested range.
#[derive(Debug, Clone)]
pub struct FileReader {
    reader: Arc<Reader>,
    file: EntryId,
    size: u64,
}

impl FileReader {
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline(always)]
    pub fn entry(&self) -> Entry<'_> {
        self.reader.entry_at(self.file)
    }
}

impl ReadAt for FileReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            let pos = offset + n as u64;
            let Some(chunk) = self.reader.chunk_for(self.file, pos) else {
                break;
            };
            let skip = pos - chunk.chunk_offset;
            let want = ((chunk.chunk_size - skip) as usize).min(buf.len() - n);
            let got = self.reader.read_chunk(chunk, skip, &mut buf[n..n + want])?;
            if got < want {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("chunk of `{}` is truncated", chunk.name),
                ));
            }
            n += got;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryType) -> TocEntry {
        TocEntry {
            name: name.to_string(),
            kind,
            ..Default::default()
        }
    }

    fn indexed(entries: Vec<TocEntry>) -> Reader {
        Reader::from_toc(
            Box::new(Vec::<u8>::new()),
            0,
            10_000,
            Toc {
                version: 1,
                entries,
            },
        )
    }

    #[test]
    fn cleans_names() {
        assert_eq!(clean_name("./a/b/"), "a/b");
        assert_eq!(clean_name("/a//b/../c"), "a/c");
        assert_eq!(clean_name("./"), "");
    }

    #[test]
    fn synthesizes_missing_parents() {
        let reader = indexed(vec![entry("a/b/c.txt", EntryType::Reg)]);
        let root = reader.root().unwrap();
        let a = root.lookup_child("a").unwrap();
        assert!(a.is_dir());
        let b = a.lookup_child("b").unwrap();
        assert_eq!(b.lookup_child("c.txt").unwrap().name, "a/b/c.txt");
        assert_eq!(root.num_link(), 3);
    }

    #[test]
    fn explicit_dir_keeps_synthesized_children() {
        let mut dir = entry("a/", EntryType::Dir);
        dir.mode = 0o700;
        let reader = indexed(vec![entry("a/x", EntryType::Reg), dir]);
        let a = reader.lookup("a").unwrap();
        assert_eq!(a.mode, 0o700);
        assert!(a.lookup_child("x").is_some());
    }

    #[test]
    fn hardlinks_resolve_to_target() {
        let mut link = entry("b", EntryType::Hardlink);
        link.link_name = "./a".into();
        let reader = indexed(vec![entry("a", EntryType::Reg), link]);
        let a = reader.lookup("a").unwrap();
        let b = reader.lookup("b").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.num_link(), 2);
        assert!(reader.root().unwrap().lookup_child("b").is_some());
    }

    #[test]
    fn chunk_lookup() {
        let mut file = entry("f", EntryType::Reg);
        file.size = 10;
        file.chunk_size = 4;
        file.offset = 100;
        let mut second = entry("f", EntryType::Chunk);
        second.chunk_offset = 4;
        second.chunk_size = 4;
        second.offset = 200;
        let mut third = entry("f", EntryType::Chunk);
        third.chunk_offset = 8;
        third.offset = 300;
        let reader = indexed(vec![file, second, third]);

        let at = |off| {
            reader
                .chunk_entry_for_offset("f", off)
                .map(|c| (c.chunk_offset, c.chunk_size, c.next_offset()))
        };
        assert_eq!(at(0), Some((0, 4, 200)));
        assert_eq!(at(3), Some((0, 4, 200)));
        assert_eq!(at(4), Some((4, 4, 300)));
        assert_eq!(at(9), Some((8, 2, 10_000)));
        assert_eq!(at(10), None);
        assert!(reader.chunk_entry_for_offset("missing", 0).is_none());
    }

    #[test]
    fn children_iterate_in_name_order() {
        let reader = indexed(vec![
            entry("d/b", EntryType::Reg),
            entry("d/a", EntryType::Reg),
            entry("d/c", EntryType::Symlink),
        ]);
        let names: Vec<_> = reader
            .lookup("d")
            .unwrap()
            .children()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
