use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;

use stargz::{EntryType, Reader, Toc, Writer};

use crate::cli::{CreateArgs, ListArgs};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wrap `input` in a gzip decoder if it starts with the gzip magic.
fn detect_gzip<'a, R: BufRead + 'a>(mut input: R) -> io::Result<Box<dyn Read + 'a>> {
    let is_gzip = input.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        tracing::debug!("stargzify: input is gzip-compressed");
        Ok(Box::new(MultiGzDecoder::new(input)))
    } else {
        Ok(Box::new(input))
    }
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    let input: Box<dyn Read> = if path == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        let file =
            File::open(path).with_context(|| format!("could not open {}", path.display()))?;
        Box::new(file)
    };
    Ok(detect_gzip(BufReader::new(input))?)
}

pub fn create(args: CreateArgs) -> Result<()> {
    let input = open_input(&args.input)?;

    let file = File::create(&args.output)
        .with_context(|| format!("could not create {}", args.output.display()))?;
    let mut out = BufWriter::new(file);

    let mut writer = Writer::new(&mut out).with_chunk_size(args.chunk_size);
    writer
        .append_tar(input)
        .with_context(|| format!("could not convert {}", args.input.display()))?;
    let entries = writer.toc().entries.len();
    let size = writer.close()?;
    out.flush()?;

    tracing::info!(
        output = %args.output.display(),
        entries,
        size,
        "stargzify: wrote archive"
    );
    Ok(())
}

struct ChunkLine {
    offset: u64,
    size: u64,
    compressed_offset: u64,
}

pub fn list(args: ListArgs) -> Result<()> {
    let reader = Reader::open_path(&args.archive)
        .with_context(|| format!("could not open {}", args.archive.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.json {
        let toc = Toc {
            version: 1,
            entries: reader.iter().map(|entry| entry.toc().clone()).collect(),
        };
        serde_json::to_writer_pretty(&mut out, &toc)?;
        writeln!(out)?;
        return Ok(());
    }

    for entry in reader.iter() {
        if entry.name.is_empty() {
            continue;
        }
        let name = if entry.is_dir() {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        match entry.kind {
            EntryType::Symlink => writeln!(out, "{name} -> {}", entry.link_name)?,
            _ if args.long => writeln!(
                out,
                "{:>10o}  {:>5}:{:<5}  {:>12}  {name}",
                entry.full_mode(),
                entry.uid,
                entry.gid,
                entry.size
            )?,
            _ => writeln!(out, "{name}")?,
        }

        if args.long && entry.kind == EntryType::Reg {
            for chunk in chunks(&reader, &entry.name) {
                writeln!(
                    out,
                    "{:>38}chunk {} +{} @ {}",
                    "", chunk.offset, chunk.size, chunk.compressed_offset
                )?;
            }
        }
    }
    Ok(())
}

/// The chunks of regular file `name`, in file order.
fn chunks(reader: &Reader, name: &str) -> Vec<ChunkLine> {
    let mut lines = Vec::new();
    let mut offset = 0;
    while let Some(chunk) = reader.chunk_entry_for_offset(name, offset) {
        lines.push(ChunkLine {
            offset: chunk.chunk_offset,
            size: chunk.chunk_size,
            compressed_offset: chunk.offset,
        });
        offset = chunk.chunk_offset + chunk.chunk_size;
        if chunk.chunk_size == 0 {
            break;
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(11);
        builder
            .append_data(&mut header, "greeting", &b"hello world"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    fn convert(input: &[u8], chunk_size: u64) -> Reader {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("layer.tar");
        let dst = dir.path().join("layer.stargz");
        std::fs::write(&src, input).unwrap();
        create(CreateArgs {
            input: src,
            output: dst.clone(),
            chunk_size,
        })
        .unwrap();
        let bytes = std::fs::read(&dst).unwrap();
        let size = bytes.len() as u64;
        Reader::open(bytes, size).unwrap()
    }

    #[test]
    fn plain_tar() {
        let reader = convert(&sample_tar(), 4);
        let chunks = chunks(&reader, "greeting");
        let spans: Vec<_> = chunks.iter().map(|c| (c.offset, c.size)).collect();
        assert_eq!(spans, [(0, 4), (4, 4), (8, 3)]);
        assert!(chunks.windows(2).all(|w| w[0].compressed_offset < w[1].compressed_offset));
    }

    #[test]
    fn gzipped_tar() {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&sample_tar()).unwrap();
        let reader = convert(&gz.finish().unwrap(), stargz::DEFAULT_CHUNK_SIZE);
        assert_eq!(reader.lookup("greeting").unwrap().size, 11);
        assert_eq!(chunks(&reader, "greeting").len(), 1);
    }

    #[test]
    fn detects_gzip_magic() {
        let mut plain = String::new();
        detect_gzip(&b"plain"[..])
            .unwrap()
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain, "plain");
    }
}
