use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use libc::{EINVAL, ENOENT, ERANGE};

use crate::attr::{Attr, DirentType};
use crate::handle::Handle;
use crate::node::Node;
use crate::{Crfs, Error, Result};

const BLOCK_SIZE: u32 = 4096;
const NAME_MAX: u32 = 255;

// Contents never change, so the kernel may keep pages across opens.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

impl From<DirentType> for FileType {
    fn from(kind: DirentType) -> Self {
        match kind {
            DirentType::Directory => FileType::Directory,
            DirentType::RegularFile => FileType::RegularFile,
            DirentType::Symlink => FileType::Symlink,
            DirentType::CharDevice => FileType::CharDevice,
            DirentType::BlockDevice => FileType::BlockDevice,
            DirentType::NamedPipe => FileType::NamedPipe,
            // fuser has no DT_UNKNOWN.
            DirentType::Unknown => FileType::RegularFile,
        }
    }
}

impl From<Attr> for FileAttr {
    fn from(attr: Attr) -> Self {
        FileAttr {
            ino: attr.inode,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind: attr.kind().into(),
            perm: attr.perm(),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// FUSE binding of a [Crfs] tree.
///
/// Keeps every node handed to the kernel, keyed by inode, and every open
/// handle, keyed by a counter.
pub struct CrfsFs {
    nodes: HashMap<u64, Arc<Node>>,
    handles: HashMap<u64, Handle>,
    next_fh: u64,
}

impl CrfsFs {
    pub fn new(crfs: &Crfs) -> CrfsFs {
        let root = Arc::clone(crfs.root());
        let mut nodes = HashMap::new();
        nodes.insert(root.inode(), root);
        CrfsFs {
            nodes,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn node(&self, ino: u64) -> Result<&Arc<Node>> {
        self.nodes.get(&ino).ok_or(Error::NotFound)
    }

    fn handle(&self, fh: u64) -> Result<&Handle> {
        self.handles.get(&fh).ok_or(Error::BadHandle(fh))
    }

    fn lookup_child(&mut self, parent: u64, name: &OsStr) -> Result<Attr> {
        let name = name.to_str().ok_or(Error::NotFound)?;
        let child = self.node(parent)?.lookup(name)?;
        let attr = child.attr()?;
        self.nodes.entry(attr.inode).or_insert(child);
        Ok(attr)
    }

    fn open_handle(&mut self, ino: u64, wants_dir: bool) -> Result<u64> {
        let handle = self.node(ino)?.open(wants_dir)?;
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        tracing::trace!(ino, fh, open = self.handles.len(), "crfs: handle opened");
        Ok(fh)
    }

    fn release_handle(&mut self, ino: u64, fh: u64) {
        if self.handles.remove(&fh).is_none() {
            tracing::warn!(ino, fh, "crfs: release of unknown handle");
        } else {
            tracing::trace!(ino, fh, open = self.handles.len(), "crfs: handle released");
        }
    }
}

/// Answer an extended attribute request using the kernel's size protocol.
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(ERANGE);
    } else {
        reply.data(data);
    }
}

impl Filesystem for CrfsFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Ok(attr) => reply.entry(&attr.valid, &attr.into(), 0),
            Err(err) => {
                tracing::trace!(parent, ?name, %err, "lookup");
                reply.error(err.errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.node(ino).and_then(|node| node.attr()) {
            Ok(attr) => reply.attr(&attr.valid, &attr.into()),
            Err(err) => {
                tracing::warn!(ino, %err, "getattr");
                reply.error(err.errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.node(ino).and_then(|node| node.readlink()) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_handle(ino, false) {
            Ok(fh) => reply.opened(fh, FOPEN_KEEP_CACHE),
            Err(err) => {
                tracing::debug!(ino, %err, "open");
                reply.error(err.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self
            .handle(fh)
            .and_then(|handle| handle.read(offset as u64, size as usize))
        {
            Ok(data) => {
                tracing::trace!(ino, fh, offset, size, read = data.len(), "read");
                reply.data(&data);
            }
            Err(err) => {
                tracing::warn!(ino, fh, offset, size, %err, "read");
                reply.error(err.errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_handle(ino, fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_handle(ino, true) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = match self.handle(fh).and_then(|handle| handle.read_dir_all()) {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(ino, fh, %err, "readdir");
                reply.error(err.errno());
                return;
            }
        };

        tracing::debug!(ino, offset, entries = listing.len(), "readdir");

        for (i, entry) in listing.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry.inode, i as i64 + 1, entry.kind.into(), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.release_handle(ino, fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(
            0,          // blocks
            0,          // bfree: read-only
            0,          // bavail: read-only
            0,          // files
            0,          // ffree: read-only
            BLOCK_SIZE, // bsize
            NAME_MAX,   // namelen
            BLOCK_SIZE, // frsize
        );
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.node(ino).and_then(|node| node.get_xattr(name, 0)) {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.node(ino).and_then(|node| node.list_xattr(0)) {
            Ok(names) => reply_xattr(reply, size, &names),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(libc::EROFS);
        } else if self.nodes.contains_key(&ino) {
            reply.ok();
        } else {
            reply.error(ENOENT);
        }
    }
}
