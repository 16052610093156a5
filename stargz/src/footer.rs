//! The 47-byte footer: an empty gzip member whose FEXTRA field points at the
//! table of contents.

use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::{Error, Result};

pub const FOOTER_SIZE: u64 = 47;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_DEFLATE: u8 = 8;
const GZIP_FLAG_EXTRA: u8 = 1 << 2;
const GZIP_OS_UNKNOWN: u8 = 255;
const EXTRA_SUFFIX: &[u8; 6] = b"STARGZ";
const EXTRA_LEN: u16 = 16 + EXTRA_SUFFIX.len() as u16;

// A final stored deflate block of length zero.
const EMPTY_DEFLATE: [u8; 5] = [0x01, 0x00, 0x00, 0xff, 0xff];

/// Encode the footer for a table of contents starting at `toc_offset`.
pub fn footer_bytes(toc_offset: u64) -> [u8; FOOTER_SIZE as usize] {
    // mtime, xfl, crc32 and isize all stay zero.
    let mut out = [0u8; FOOTER_SIZE as usize];
    out[..2].copy_from_slice(&GZIP_MAGIC);
    out[2] = GZIP_DEFLATE;
    out[3] = GZIP_FLAG_EXTRA;
    out[9] = GZIP_OS_UNKNOWN;
    LittleEndian::write_u16(&mut out[10..12], EXTRA_LEN);
    out[12..28].copy_from_slice(format!("{:016x}", toc_offset).as_bytes());
    out[28..34].copy_from_slice(EXTRA_SUFFIX);
    out[34..39].copy_from_slice(&EMPTY_DEFLATE);
    out
}

/// Decode the table of contents offset from the final [FOOTER_SIZE] bytes of an archive.
pub fn parse_footer(footer: &[u8]) -> Result<u64> {
    if footer.len() != FOOTER_SIZE as usize {
        return Err(Error::InvalidFooter("wrong footer length"));
    }

    let mut cursor = Cursor::new(footer);
    let mut magic = [0u8; 2];
    cursor.read_exact(&mut magic)?;
    if magic != GZIP_MAGIC || cursor.read_u8()? != GZIP_DEFLATE {
        return Err(Error::InvalidFooter("not a gzip member"));
    }
    if cursor.read_u8()? & GZIP_FLAG_EXTRA == 0 {
        return Err(Error::InvalidFooter("missing extra field"));
    }
    // mtime, xfl, os
    cursor.set_position(10);
    if cursor.read_u16::<LittleEndian>()? != EXTRA_LEN {
        return Err(Error::InvalidFooter("unexpected extra field length"));
    }

    let mut extra = [0u8; EXTRA_LEN as usize];
    cursor.read_exact(&mut extra)?;
    let (hex, suffix) = extra.split_at(16);
    if suffix != EXTRA_SUFFIX {
        return Err(Error::InvalidFooter("missing STARGZ marker"));
    }

    std::str::from_utf8(hex)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or(Error::InvalidFooter("table of contents offset is not hex"))
}
