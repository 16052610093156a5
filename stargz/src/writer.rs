use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use chrono::DateTime;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use crate::footer::footer_bytes;
use crate::io::CountingWriter;
use crate::toc::{EntryType, Toc, TocEntry};
use crate::{DEFAULT_CHUNK_SIZE, Error, Result, TOC_TAR_NAME};

const BLOCK_SIZE: u64 = 512;
const COPY_BUFFER: usize = 64 * 1024;
const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

enum Sink<W: Write> {
    Plain(CountingWriter<W>),
    Gzip(GzEncoder<CountingWriter<W>>),
    /// A previous write failed part way through a state change.
    Poisoned,
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stargz writer is unusable after an earlier error")
}

/// Converts tar streams into a stargz archive.
///
/// Call [append_tar][Writer::append_tar] one or more times, then
/// [close][Writer::close] to write the table of contents and footer.
pub struct Writer<W: Write> {
    sink: Sink<W>,
    toc: Toc,
    chunk_size: u64,
}

impl<W: Write> Writer<W> {
    pub fn new(w: W) -> Writer<W> {
        Writer {
            sink: Sink::Plain(CountingWriter::new(w)),
            toc: Toc {
                version: 1,
                entries: Vec::new(),
            },
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Split regular files into chunks of at most `chunk_size` uncompressed bytes.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Writer<W> {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Entries recorded so far.
    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    fn open_gz(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.sink, Sink::Poisoned) {
            Sink::Plain(out) => {
                self.sink = Sink::Gzip(GzEncoder::new(out, Compression::default()));
                Ok(())
            }
            gz @ Sink::Gzip(_) => {
                self.sink = gz;
                Ok(())
            }
            Sink::Poisoned => Err(poisoned()),
        }
    }

    fn close_gz(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.sink, Sink::Poisoned) {
            Sink::Gzip(gz) => {
                self.sink = Sink::Plain(gz.finish()?);
                Ok(())
            }
            plain @ Sink::Plain(_) => {
                self.sink = plain;
                Ok(())
            }
            Sink::Poisoned => Err(poisoned()),
        }
    }

    /// Compressed bytes written so far. Only meaningful between gzip members.
    fn compressed_offset(&self) -> io::Result<u64> {
        match &self.sink {
            Sink::Plain(out) => Ok(out.bytes_written()),
            _ => Err(poisoned()),
        }
    }

    fn write_gz(&mut self, buf: &[u8]) -> io::Result<()> {
        self.open_gz()?;
        match &mut self.sink {
            Sink::Gzip(gz) => gz.write_all(buf),
            _ => Err(poisoned()),
        }
    }

    fn write_padding(&mut self, len: u64) -> io::Result<()> {
        let pad = (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE;
        self.write_gz(&[0u8; BLOCK_SIZE as usize][..pad as usize])
    }

    /// Append every member of the tar stream `r`.
    pub fn append_tar<R: Read>(&mut self, r: R) -> Result<()> {
        let mut archive = tar::Archive::new(r);
        for entry in archive.entries().map_err(Error::InvalidTar)? {
            let mut entry = entry.map_err(Error::InvalidTar)?;
            self.append_entry(&mut entry)?;
        }
        Ok(())
    }

    fn append_entry<R: Read>(&mut self, entry: &mut tar::Entry<'_, R>) -> Result<()> {
        let header = entry.header().clone();
        let path = entry
            .path()
            .map_err(Error::InvalidTar)?
            .to_string_lossy()
            .into_owned();

        let kind = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryType::Reg,
            tar::EntryType::Directory => EntryType::Dir,
            tar::EntryType::Symlink => EntryType::Symlink,
            tar::EntryType::Link => EntryType::Hardlink,
            tar::EntryType::Char => EntryType::Char,
            tar::EntryType::Block => EntryType::Block,
            tar::EntryType::Fifo => EntryType::Fifo,
            other => {
                tracing::debug!(?other, path = %path, "stargz: skipping tar member");
                return Ok(());
            }
        };
        if path.trim_start_matches("./") == TOC_TAR_NAME {
            tracing::warn!("stargz: input already contains a table of contents, skipped");
            return Ok(());
        }

        let link_name = entry
            .link_name()
            .map_err(Error::InvalidTar)?
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut xattrs = BTreeMap::new();
        if let Some(extensions) = entry.pax_extensions().map_err(Error::InvalidTar)? {
            for ext in extensions {
                let ext = ext.map_err(Error::InvalidTar)?;
                let Ok(key) = ext.key() else { continue };
                if let Some(name) = key.strip_prefix(XATTR_PAX_PREFIX) {
                    xattrs.insert(name.to_string(), ext.value_bytes().to_vec());
                }
            }
        }

        let size = if kind == EntryType::Reg {
            header.entry_size().map_err(Error::InvalidTar)?
        } else {
            0
        };
        let (dev_major, dev_minor) = match kind {
            EntryType::Char | EntryType::Block => (
                header.device_major().map_err(Error::InvalidTar)?.unwrap_or(0),
                header.device_minor().map_err(Error::InvalidTar)?.unwrap_or(0),
            ),
            _ => (0, 0),
        };

        let mut ent = TocEntry {
            name: path.clone(),
            kind,
            size,
            mod_time: header
                .mtime()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
            link_name: link_name.clone(),
            mode: header.mode().map_err(Error::InvalidTar)? & 0o7777,
            uid: owner_id(header.uid(), "uid", &path),
            gid: owner_id(header.gid(), "gid", &path),
            user_name: header.username().ok().flatten().unwrap_or_default().to_string(),
            group_name: header.groupname().ok().flatten().unwrap_or_default().to_string(),
            dev_major,
            dev_minor,
            xattrs,
            ..Default::default()
        };

        let mut out_header = header;
        out_header.set_size(size);
        let link = matches!(kind, EntryType::Symlink | EntryType::Hardlink).then_some(&*link_name);
        let header_bytes = encode_header(&mut out_header, &path, link).map_err(Error::InvalidTar)?;
        self.write_gz(&header_bytes)?;

        if kind != EntryType::Reg || size == 0 {
            self.toc.entries.push(ent);
            return Ok(());
        }

        let file_index = self.toc.entries.len();
        let mut file_digest = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;

        while written < size {
            self.close_gz()?;
            let remaining = size - written;
            let chunk_size = remaining.min(self.chunk_size);
            let mut chunk = if written == 0 {
                std::mem::take(&mut ent)
            } else {
                TocEntry {
                    name: path.clone(),
                    kind: EntryType::Chunk,
                    ..Default::default()
                }
            };
            if remaining > self.chunk_size {
                chunk.chunk_size = chunk_size;
            }
            chunk.offset = self.compressed_offset()?;
            chunk.chunk_offset = written;

            let mut chunk_digest = Sha256::new();
            let mut left = chunk_size;
            while left > 0 {
                let want = left.min(buf.len() as u64) as usize;
                let n = entry.read(&mut buf[..want]).map_err(Error::InvalidTar)?;
                if n == 0 {
                    return Err(Error::InvalidTar(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("tar member `{path}` ended early"),
                    )));
                }
                file_digest.update(&buf[..n]);
                chunk_digest.update(&buf[..n]);
                self.write_gz(&buf[..n])?;
                left -= n as u64;
            }
            chunk.chunk_digest = format!("sha256:{}", hex::encode(chunk_digest.finalize()));

            self.toc.entries.push(chunk);
            written += chunk_size;
        }

        self.toc.entries[file_index].digest =
            format!("sha256:{}", hex::encode(file_digest.finalize()));
        self.write_padding(size)?;

        tracing::trace!(path = %path, size, "stargz: appended file");
        Ok(())
    }

    /// Write the table of contents and footer, returning the archive's total size.
    pub fn close(mut self) -> Result<u64> {
        self.close_gz()?;
        let toc_offset = self.compressed_offset()?;

        let json = serde_json::to_vec_pretty(&self.toc).map_err(Error::InvalidToc)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o444);
        header.set_size(json.len() as u64);
        header.set_mtime(0);
        let header_bytes = encode_header(&mut header, TOC_TAR_NAME, None)?;

        self.write_gz(&header_bytes)?;
        self.write_gz(&json)?;
        self.write_padding(json.len() as u64)?;
        self.write_gz(&[0u8; 2 * BLOCK_SIZE as usize])?;
        self.close_gz()?;

        match &mut self.sink {
            Sink::Plain(out) => {
                out.write_all(&footer_bytes(toc_offset))?;
                out.flush()?;
                tracing::debug!(
                    entries = self.toc.entries.len(),
                    toc_offset,
                    size = out.bytes_written(),
                    "stargz: archive written"
                );
                Ok(out.bytes_written())
            }
            _ => Err(poisoned().into()),
        }
    }
}

/// A numeric owner field; blank or garbled fields read as 0, like GNU tar.
fn owner_id(field: io::Result<u64>, what: &str, path: &str) -> u32 {
    match field {
        Ok(id) => id as u32,
        Err(err) => {
            tracing::trace!(path, field = what, %err, "stargz: unreadable owner, using 0");
            0
        }
    }
}

/// Serialize `header` for `path`, including any GNU long name records it needs.
fn encode_header(header: &mut tar::Header, path: &str, link: Option<&str>) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    match link {
        Some(target) => builder.append_link(header, path, target)?,
        None => builder.append_data(header, path, io::empty())?,
    }
    Ok(std::mem::take(builder.get_mut()))
}
