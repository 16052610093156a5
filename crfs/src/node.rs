//! The mounted tree: a static root, the `layers` directory of local archives,
//! and nodes backed by table of contents entries.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use stargz::{EntryId, EntryType, Reader};

use crate::attr::{Attr, DirentType};
use crate::dir::{self, DirEntry};
use crate::handle::{CachedFile, Handle, StargzFile, StaticFile};
use crate::inode::{LazyInode, next_inode};
use crate::overlay::{self, OPAQUE_XATTR, OPAQUE_XATTR_VALUE, WHITEOUT_PREFIX};
use crate::{Error, LAYER_SUFFIX, Result, lock};

pub(crate) const README: &str = "This is CRFS. See https://github.com/google/crfs.\n";

/// A node of the mounted tree. Nodes are created on first lookup and kept by
/// their parent for the life of the mount, so a name always resolves to the
/// same node and inode.
pub struct Node {
    inode: LazyInode,
    kind: Kind,
}

enum Kind {
    Root(BTreeMap<&'static str, Arc<Node>>),
    Layers(Layers),
    Readme,
    Content(Content),
    Whiteout(Whiteout),
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Node");
        s.field("inode", &self.inode);
        match &self.kind {
            Kind::Root(children) => s.field("root", &children.keys().collect::<Vec<_>>()),
            Kind::Layers(layers) => s.field("layers", &layers.dir),
            Kind::Readme => s.field("readme", &README.len()),
            Kind::Content(content) => s
                .field("entry", &content.entry)
                .field("opaque", &content.opaque),
            Kind::Whiteout(whiteout) => s.field("whiteout", &whiteout.entry),
        };
        s.finish()
    }
}

/// Directory listing the `*.stargz` files of a local directory.
struct Layers {
    dir: PathBuf,
    state: Mutex<LayerState>,
}

#[derive(Default)]
struct LayerState {
    nodes: HashMap<String, Arc<Node>>,
    /// Inodes handed out in listings for layers not yet opened.
    reserved: HashMap<String, u32>,
}

struct Content {
    reader: Arc<Reader>,
    entry: EntryId,
    opaque: bool,
    children: Mutex<HashMap<String, Arc<Node>>>,
}

struct Whiteout {
    reader: Arc<Reader>,
    /// The `.wh.` entry, not the hidden target.
    entry: EntryId,
}

/// Open a local layer archive and check it has a root directory.
pub(crate) fn open_layer(path: &Path) -> Result<Arc<Reader>> {
    let reader = Reader::open_path(path).map_err(|source| Error::OpenLayer {
        path: path.to_path_buf(),
        source,
    })?;
    if reader.root().is_none() {
        return Err(Error::MissingRoot {
            path: path.to_path_buf(),
        });
    }
    tracing::info!(path = %path.display(), size = reader.size(), "crfs: opened layer");
    Ok(Arc::new(reader))
}

impl Node {
    fn new(inode: LazyInode, kind: Kind) -> Node {
        Node { inode, kind }
    }

    /// The mount root. `rootfs`, when given, is shown as a `rootfs` directory.
    pub(crate) fn root(layers_dir: PathBuf, rootfs: Option<Arc<Reader>>) -> Result<Node> {
        let mut children = BTreeMap::new();
        children.insert(
            crate::README_NAME,
            Arc::new(Node::new(LazyInode::new(), Kind::Readme)),
        );
        children.insert(
            crate::LAYERS_DIR_NAME,
            Arc::new(Node::new(
                LazyInode::new(),
                Kind::Layers(Layers {
                    dir: layers_dir,
                    state: Mutex::default(),
                }),
            )),
        );
        if let Some(reader) = rootfs {
            children.insert(
                crate::ROOTFS_NAME,
                Arc::new(Node::layer_root(LazyInode::new(), reader)?),
            );
        }
        Ok(Node::new(
            LazyInode::preset(crate::inode::ROOT_INODE),
            Kind::Root(children),
        ))
    }

    fn layer_root(inode: LazyInode, reader: Arc<Reader>) -> Result<Node> {
        let root = reader.root().ok_or(Error::NotFound)?;
        let content = Content {
            entry: root.id(),
            opaque: overlay::is_opaque(&root),
            reader: Arc::clone(&reader),
            children: Mutex::default(),
        };
        Ok(Node::new(inode, Kind::Content(content)))
    }

    #[inline(always)]
    pub fn inode(&self) -> u64 {
        self.inode.get() as u64
    }

    pub fn is_dir(&self) -> bool {
        self.dirent_type() == DirentType::Directory
    }

    /// Whether this is an archive directory carrying the opaque marker.
    pub fn is_opaque(&self) -> bool {
        matches!(&self.kind, Kind::Content(content) if content.opaque)
    }

    pub fn dirent_type(&self) -> DirentType {
        match &self.kind {
            Kind::Root(_) | Kind::Layers(_) => DirentType::Directory,
            Kind::Readme => DirentType::RegularFile,
            Kind::Content(content) => content
                .entry()
                .map(|entry| DirentType::from(entry.kind))
                .unwrap_or(DirentType::Unknown),
            Kind::Whiteout(_) => DirentType::CharDevice,
        }
    }

    pub fn attr(&self) -> Result<Attr> {
        let inode = self.inode();
        match &self.kind {
            Kind::Root(children) => {
                let subdirs = children.values().filter(|child| child.is_dir()).count() as u32;
                Ok(Attr::directory(inode, 2 + subdirs))
            }
            Kind::Layers(_) => Ok(Attr::directory(inode, 2)),
            Kind::Readme => Ok(Attr::static_file(inode, README.len() as u64)),
            Kind::Content(content) => Ok(Attr::from_entry(inode, &content.entry()?)),
            Kind::Whiteout(whiteout) => {
                let entry = whiteout.reader.entry(whiteout.entry).ok_or(Error::NotFound)?;
                Ok(Attr::whiteout(inode, &entry))
            }
        }
    }

    /// Resolve a child by name. Repeated lookups return the same node.
    pub fn lookup(&self, name: &str) -> Result<Arc<Node>> {
        tracing::trace!(parent = self.inode(), name, "crfs: lookup");
        match &self.kind {
            Kind::Root(children) => children.get(name).cloned().ok_or(Error::NotFound),
            Kind::Layers(layers) => layers.lookup(name),
            Kind::Content(content) => content.lookup(name),
            Kind::Readme | Kind::Whiteout(_) => Err(Error::NotDirectory),
        }
    }

    /// Every visible child, sorted by name. Inodes match those of lookup.
    pub fn read_dir_all(&self) -> Result<Vec<DirEntry>> {
        match &self.kind {
            Kind::Root(children) => Ok(children
                .iter()
                .map(|(name, child)| DirEntry {
                    inode: child.inode(),
                    kind: child.dirent_type(),
                    name: name.to_string(),
                })
                .collect()),
            Kind::Layers(layers) => layers.read_dir_all(),
            Kind::Content(content) => content.read_dir_all(),
            Kind::Readme | Kind::Whiteout(_) => Err(Error::NotDirectory),
        }
    }

    pub fn readlink(&self) -> Result<String> {
        if let Kind::Content(content) = &self.kind {
            let entry = content.entry()?;
            if entry.kind == EntryType::Symlink {
                return Ok(entry.link_name.clone());
            }
        }
        Err(Error::InvalidOperation("readlink on a non-symlink"))
    }

    /// NUL-separated attribute names, from byte `position` on.
    pub fn list_xattr(&self, position: usize) -> Result<Vec<u8>> {
        let mut names = Vec::new();
        if let Kind::Content(content) = &self.kind {
            if content.opaque {
                names.extend_from_slice(OPAQUE_XATTR.as_bytes());
                names.push(0);
            }
            for name in content.entry()?.toc().xattrs.keys() {
                // Reported only for directories holding the marker.
                if name == OPAQUE_XATTR {
                    continue;
                }
                names.extend_from_slice(name.as_bytes());
                names.push(0);
            }
        }
        Ok(suffix(names, position))
    }

    /// The value of attribute `name`, from byte `position` on.
    pub fn get_xattr(&self, name: &str, position: usize) -> Result<Vec<u8>> {
        let Kind::Content(content) = &self.kind else {
            return Err(Error::NoXattr(name.to_string()));
        };
        let value = if name == OPAQUE_XATTR {
            content.opaque.then(|| OPAQUE_XATTR_VALUE.to_vec())
        } else {
            content.entry()?.toc().xattrs.get(name).cloned()
        };
        match value {
            Some(value) => Ok(suffix(value, position)),
            None => Err(Error::NoXattr(name.to_string())),
        }
    }

    /// Open for reading, or for listing when `wants_dir` is set.
    pub fn open(self: &Arc<Self>, wants_dir: bool) -> Result<Handle> {
        let is_dir = self.is_dir();
        if wants_dir {
            if !is_dir {
                return Err(Error::NotDirectory);
            }
            tracing::debug!(inode = self.inode(), "crfs: opened directory");
            return Ok(Handle::directory(Arc::clone(self)));
        }
        if is_dir {
            return Err(Error::IsDirectory);
        }

        let file = match &self.kind {
            Kind::Readme => CachedFile::new(StaticFile(README.as_bytes())),
            Kind::Content(content) => {
                let entry = content.entry()?;
                CachedFile::new(StargzFile::open(&content.reader, &entry.name)?)
            }
            _ => return Err(Error::InvalidOperation("open on a special file")),
        };
        tracing::debug!(inode = self.inode(), "crfs: opened file");
        Ok(Handle::file(Arc::clone(self), file))
    }
}

fn suffix(mut data: Vec<u8>, position: usize) -> Vec<u8> {
    if position >= data.len() {
        return Vec::new();
    }
    data.split_off(position)
}

impl Layers {
    fn lookup(&self, name: &str) -> Result<Arc<Node>> {
        if let Some(node) = lock(&self.state).nodes.get(name) {
            return Ok(Arc::clone(node));
        }
        if !name.ends_with(LAYER_SUFFIX) || name.contains('/') {
            return Err(Error::NotFound);
        }

        // Opening reads the table of contents, so the lock is not held here.
        let reader = open_layer(&self.dir.join(name))?;

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(node) = state.nodes.get(name) {
            return Ok(Arc::clone(node));
        }
        let inode = state
            .reserved
            .remove(name)
            .map(LazyInode::preset)
            .unwrap_or_default();
        let node = Arc::new(Node::layer_root(inode, reader)?);
        state.nodes.insert(name.to_string(), Arc::clone(&node));
        Ok(node)
    }

    fn read_dir_all(&self) -> Result<Vec<DirEntry>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(LAYER_SUFFIX) && !entry.file_type()?.is_dir() {
                names.push(name);
            }
        }
        names.sort_unstable();

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        Ok(names
            .into_iter()
            .map(|name| {
                let inode = match state.nodes.get(&name) {
                    Some(node) => node.inode(),
                    None => *state.reserved.entry(name.clone()).or_insert_with(next_inode) as u64,
                };
                DirEntry {
                    inode,
                    kind: DirentType::Directory,
                    name,
                }
            })
            .collect())
    }
}

impl Content {
    fn entry(&self) -> Result<stargz::Entry<'_>> {
        self.reader.entry(self.entry).ok_or(Error::NotFound)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Node>> {
        let mut children = lock(&self.children);
        if let Some(node) = children.get(name) {
            return Ok(Arc::clone(node));
        }

        // `.wh.` names only ever surface as the whiteout they produce.
        if name.starts_with(WHITEOUT_PREFIX) {
            return Err(Error::NotFound);
        }

        let dir = self.entry()?;
        if !dir.is_dir() {
            return Err(Error::NotDirectory);
        }

        let kind = match dir.lookup_child(name) {
            Some(child) => {
                let opaque = overlay::is_opaque(&child);
                if opaque {
                    tracing::debug!(name, "crfs: opaque directory");
                }
                Kind::Content(Content {
                    reader: Arc::clone(&self.reader),
                    entry: child.id(),
                    opaque,
                    children: Mutex::default(),
                })
            }
            None => match dir.lookup_child(&overlay::whiteout_name(name)) {
                Some(whiteout) => {
                    tracing::debug!(name, "crfs: whiteout");
                    Kind::Whiteout(Whiteout {
                        reader: Arc::clone(&self.reader),
                        entry: whiteout.id(),
                    })
                }
                None => return Err(Error::NotFound),
            },
        };

        let node = Arc::new(Node::new(LazyInode::new(), kind));
        children.insert(name.to_string(), Arc::clone(&node));
        Ok(node)
    }

    fn read_dir_all(&self) -> Result<Vec<DirEntry>> {
        let dir = self.entry()?;
        if !dir.is_dir() {
            return Err(Error::NotDirectory);
        }
        dir::merge(&dir)
            .into_iter()
            .map(|merged| {
                let node = self.lookup(merged.name)?;
                Ok(DirEntry {
                    inode: node.inode(),
                    kind: merged.kind,
                    name: merged.name.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Member, layer};

    fn mounted(members: &[Member<'_>]) -> Arc<Node> {
        Arc::new(Node::layer_root(LazyInode::new(), layer(members)).unwrap())
    }

    #[test]
    fn lookup_is_stable() {
        let root = mounted(&[Member::file("dir/a.txt", b"hello")]);
        let dir = root.lookup("dir").unwrap();
        let first = dir.lookup("a.txt").unwrap();
        let second = root.lookup("dir").unwrap().lookup("a.txt").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.inode(), second.inode());
        assert_ne!(first.inode(), dir.inode());
    }

    #[test]
    fn whiteout_prefixed_names_are_hidden() {
        let root = mounted(&[Member::file("dir/.wh.gone", b"")]);
        let dir = root.lookup("dir").unwrap();
        assert!(matches!(dir.lookup(".wh.gone"), Err(Error::NotFound)));

        let gone = dir.lookup("gone").unwrap();
        assert_eq!(gone.dirent_type(), DirentType::CharDevice);
        let attr = gone.attr().unwrap();
        assert_eq!(attr.kind(), DirentType::CharDevice);
        assert_eq!(attr.rdev, 0);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 0);

        assert!(matches!(dir.lookup("never"), Err(Error::NotFound)));
    }

    #[test]
    fn listing_inodes_match_lookup() {
        let root = mounted(&[
            Member::file("dir/a.txt", b"hello"),
            Member::file("dir/.wh.b.txt", b""),
        ]);
        let dir = root.lookup("dir").unwrap();
        for entry in dir.read_dir_all().unwrap() {
            assert_eq!(dir.lookup(&entry.name).unwrap().inode(), entry.inode);
        }
    }

    #[test]
    fn whiteout_of_a_whiteout_name_keeps_the_listing() {
        let root = mounted(&[Member::file("dir/a", b"x"), Member::file("dir/.wh..wh.x", b"")]);
        let dir = root.lookup("dir").unwrap();
        let listing = dir.read_dir_all().unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a"]);
        assert!(matches!(dir.lookup(".wh.x"), Err(Error::NotFound)));
        assert!(matches!(dir.lookup("x"), Err(Error::NotFound)));
    }

    #[test]
    fn opaque_directories_report_the_marker() {
        let root = mounted(&[
            Member::dir("dir"),
            Member::file("dir/.wh..wh..opq", b""),
            Member::file("plain/x", b""),
        ]);
        let dir = root.lookup("dir").unwrap();
        assert!(dir.is_opaque());
        assert_eq!(dir.get_xattr(OPAQUE_XATTR, 0).unwrap(), b"y");
        assert_eq!(dir.list_xattr(0).unwrap(), b"trusted.overlay.opaque\0");
        assert!(dir.list_xattr(100).unwrap().is_empty());
        assert_eq!(dir.list_xattr(8).unwrap(), b"overlay.opaque\0");
        assert!(dir.read_dir_all().unwrap().is_empty());

        let plain = root.lookup("plain").unwrap();
        assert!(!plain.is_opaque());
        assert!(matches!(
            plain.get_xattr(OPAQUE_XATTR, 0),
            Err(Error::NoXattr(_))
        ));
        assert!(plain.list_xattr(0).unwrap().is_empty());
    }

    #[test]
    fn readlink_only_for_symlinks() {
        let root = mounted(&[
            Member::symlink("link", "target/file"),
            Member::file("file", b"x"),
        ]);
        let link = root.lookup("link").unwrap();
        assert_eq!(link.readlink().unwrap(), "target/file");
        assert_eq!(link.attr().unwrap().size, "target/file".len() as u64);
        assert!(matches!(
            root.lookup("file").unwrap().readlink(),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn open_checks_the_node_kind() {
        let root = mounted(&[Member::file("dir/a.txt", b"hello")]);
        let dir = root.lookup("dir").unwrap();
        let file = dir.lookup("a.txt").unwrap();

        assert!(matches!(dir.open(false), Err(Error::IsDirectory)));
        assert!(matches!(file.open(true), Err(Error::NotDirectory)));

        let handle = file.open(false).unwrap();
        assert_eq!(handle.read(0, 10).unwrap(), b"hello");
        assert!(matches!(handle.read_dir_all(), Err(Error::NotDirectory)));

        let listing = dir.open(true).unwrap();
        assert_eq!(listing.read_dir_all().unwrap().len(), 1);
        assert!(matches!(listing.read(0, 1), Err(Error::IsDirectory)));
    }

    #[test]
    fn static_root() {
        let root = Node::root(PathBuf::from("/nonexistent"), None).unwrap();
        assert_eq!(root.inode(), 1);
        let names: Vec<_> = root
            .read_dir_all()
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            names,
            [
                ("README-crfs.txt".to_string(), DirentType::RegularFile),
                ("layers".to_string(), DirentType::Directory),
            ]
        );
        assert_eq!(root.attr().unwrap().nlink, 3);

        let readme = Arc::new(Node::root(PathBuf::from("."), None).unwrap())
            .lookup(crate::README_NAME)
            .unwrap();
        assert_eq!(readme.attr().unwrap().size, README.len() as u64);
        let handle = readme.open(false).unwrap();
        assert_eq!(handle.read(0, 4096).unwrap(), README.as_bytes());
    }
}
