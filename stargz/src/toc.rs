use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable ordinal of an entry within a [Reader][crate::Reader]'s flattened table.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    #[inline(always)]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Dir,
    #[default]
    Reg,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
    /// A continuation of the preceding `reg` entry's payload.
    Chunk,
    #[serde(other)]
    Unknown,
}

impl EntryType {
    /// File type bits as found in `st_mode`.
    pub fn mode_bits(self) -> u32 {
        match self {
            EntryType::Dir => S_IFDIR,
            EntryType::Reg | EntryType::Hardlink | EntryType::Chunk => S_IFREG,
            EntryType::Symlink => S_IFLNK,
            EntryType::Char => S_IFCHR,
            EntryType::Block => S_IFBLK,
            EntryType::Fifo => S_IFIFO,
            EntryType::Unknown => 0,
        }
    }
}

pub(crate) const S_IFMT: u32 = 0o170000;
pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFREG: u32 = 0o100000;
pub(crate) const S_IFLNK: u32 = 0o120000;
pub(crate) const S_IFCHR: u32 = 0o020000;
pub(crate) const S_IFBLK: u32 = 0o060000;
pub(crate) const S_IFIFO: u32 = 0o010000;

/// The JSON document stored as [TOC_TAR_NAME][crate::TOC_TAR_NAME].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Toc {
    pub version: u32,
    pub entries: Vec<TocEntry>,
}

/// One archive member's metadata record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    /// Path within the archive, as written by the producer. The reader cleans
    /// it (no leading `./` or `/`, no trailing `/`) while indexing.
    pub name: String,

    #[serde(rename = "type")]
    pub kind: EntryType,

    /// Uncompressed size of a `reg` entry's whole payload.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    #[serde(rename = "modtime", default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,

    /// Symlink target, or the target path of a `hardlink`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,

    /// Permission and special bits; the file type comes from `kind`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mode: u32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub uid: u32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub gid: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,

    /// Compressed offset of the gzip member holding this entry's payload.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub dev_major: u32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub dev_minor: u32,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "base64_values"
    )]
    pub xattrs: BTreeMap<String, Vec<u8>>,

    /// `sha256:`-prefixed digest of the whole payload of a `reg` entry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,

    /// Uncompressed offset of this chunk within the file.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_offset: u64,

    /// Uncompressed length of this chunk. Zero means "up to the end of the file".
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_size: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,

    #[serde(skip)]
    pub(crate) id: EntryId,

    #[serde(skip)]
    pub(crate) next_offset: u64,

    #[serde(skip)]
    pub(crate) num_link: u32,

    #[serde(skip)]
    pub(crate) children: BTreeMap<String, EntryId>,
}

impl TocEntry {
    #[inline(always)]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Whether this entry carries payload bytes.
    #[inline(always)]
    pub fn is_data_type(&self) -> bool {
        matches!(self.kind, EntryType::Reg | EntryType::Chunk)
    }

    #[inline(always)]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryType::Dir
    }

    /// Compressed offset at which the next payload-carrying entry starts.
    #[inline(always)]
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Number of names referring to this entry. Zero if the archive said nothing.
    #[inline(always)]
    pub fn num_link(&self) -> u32 {
        self.num_link
    }

    /// Full `st_mode`: permission bits plus the file type bits.
    #[inline(always)]
    pub fn full_mode(&self) -> u32 {
        (self.mode & !S_IFMT) | self.kind.mode_bits()
    }

    /// Final path component.
    pub fn base_name(&self) -> &str {
        self.name
            .rsplit_once('/')
            .map(|(_, base)| base)
            .unwrap_or(&self.name)
    }
}

fn is_zero<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

/// Extended attribute values travel as base64 strings.
mod base64_values {
    use std::collections::BTreeMap;

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &STANDARD.encode(value))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value.as_bytes())
                    .map(|value| (key, value))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
