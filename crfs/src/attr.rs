use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stargz::EntryType;

use crate::TTL;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;
const S_IFIFO: u32 = libc::S_IFIFO as u32;

/// Directory entry type, as reported by `readdir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirentType {
    Directory,
    RegularFile,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Unknown,
}

impl From<EntryType> for DirentType {
    fn from(kind: EntryType) -> Self {
        match kind {
            EntryType::Dir => DirentType::Directory,
            EntryType::Reg | EntryType::Hardlink | EntryType::Chunk => DirentType::RegularFile,
            EntryType::Symlink => DirentType::Symlink,
            EntryType::Char => DirentType::CharDevice,
            EntryType::Block => DirentType::BlockDevice,
            EntryType::Fifo => DirentType::NamedPipe,
            EntryType::Unknown => DirentType::Unknown,
        }
    }
}

/// Attributes of a node, independent of the FUSE binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub inode: u64,
    pub size: u64,
    /// 512-byte blocks.
    pub blocks: u64,
    pub mtime: SystemTime,
    /// Permission bits plus file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub nlink: u32,
    /// How long the kernel may cache these attributes.
    pub valid: Duration,
}

impl Attr {
    pub(crate) fn directory(inode: u64, nlink: u32) -> Attr {
        Attr {
            inode,
            size: 0,
            blocks: 0,
            mtime: UNIX_EPOCH,
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            nlink,
            valid: TTL,
        }
    }

    pub(crate) fn static_file(inode: u64, size: u64) -> Attr {
        Attr {
            inode,
            size,
            blocks: blocks_of(size),
            mtime: UNIX_EPOCH,
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            rdev: 0,
            nlink: 1,
            valid: TTL,
        }
    }

    pub(crate) fn from_entry(inode: u64, entry: &stargz::Entry<'_>) -> Attr {
        let stat = entry.stat();
        let size = match entry.kind {
            EntryType::Symlink => entry.link_name.len() as u64,
            _ => stat.size,
        };
        Attr {
            inode,
            size,
            blocks: blocks_of(size),
            mtime: stat.mod_time,
            mode: stat.mode,
            uid: entry.uid,
            gid: entry.gid,
            rdev: makedev(entry.dev_major, entry.dev_minor),
            // Archives commonly leave the link count out, meaning one.
            nlink: entry.num_link().max(1),
            valid: TTL,
        }
    }

    /// An overlay whiteout: a character device numbered 0/0.
    pub(crate) fn whiteout(inode: u64, entry: &stargz::Entry<'_>) -> Attr {
        Attr {
            inode,
            size: 0,
            blocks: 0,
            mtime: entry.stat().mod_time,
            mode: S_IFCHR,
            uid: entry.uid,
            gid: entry.gid,
            rdev: makedev(0, 0),
            nlink: 1,
            valid: TTL,
        }
    }

    #[inline(always)]
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    pub fn kind(&self) -> DirentType {
        match self.mode & S_IFMT {
            S_IFDIR => DirentType::Directory,
            S_IFREG => DirentType::RegularFile,
            S_IFLNK => DirentType::Symlink,
            S_IFCHR => DirentType::CharDevice,
            S_IFBLK => DirentType::BlockDevice,
            S_IFIFO => DirentType::NamedPipe,
            _ => DirentType::Unknown,
        }
    }
}

/// Number of 512-byte blocks needed to hold `size` bytes.
#[inline(always)]
pub fn blocks_of(size: u64) -> u64 {
    size.div_ceil(512)
}

/// Pack a device number the way the host's `stat` reports it.
pub fn makedev(major: u32, minor: u32) -> u32 {
    libc::makedev(major, minor) as u32
}
