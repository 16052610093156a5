//! crfs serves stargz container layers as a read-only filesystem.
//!
//! Each layer is presented the way overlayfs expects a lower layer to look:
//! `.wh.<name>` whiteouts appear as 0/0 character devices and directories
//! holding the opaque marker report `trusted.overlay.opaque=y`, so a real
//! overlay mount can be stacked on top.
//!
//! [Crfs] builds the tree of [Node]s; [CrfsFs] binds it to FUSE.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

mod attr;
mod dir;
mod error;
mod fuse;
mod handle;
pub mod inode;
mod node;
pub mod overlay;

#[cfg(test)]
mod testing;

pub use attr::{Attr, DirentType, blocks_of, makedev};
pub use dir::{DirEntry, Merged, merge};
pub use error::{Error, Result};
pub use fuse::CrfsFs;
pub use handle::{CachedFile, ChunkSource, ChunkSpan, Handle};
pub use node::Node;

/// Archives are immutable for the life of the mount, so attributes and
/// entries can be cached by the kernel for a long time.
pub const TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// File name suffix of the layers shown under [LAYERS_DIR_NAME].
pub const LAYER_SUFFIX: &str = ".stargz";

pub const LAYERS_DIR_NAME: &str = "layers";
pub const README_NAME: &str = "README-crfs.txt";
pub const ROOTFS_NAME: &str = "rootfs";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory whose `*.stargz` files are listed under `layers/`.
    pub layers_dir: PathBuf,
    /// A file in `layers_dir` to also expose as `rootfs/`.
    pub rootfs: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            layers_dir: PathBuf::from("."),
            rootfs: None,
        }
    }
}

/// A mountable tree.
#[derive(Debug)]
pub struct Crfs {
    root: Arc<Node>,
}

impl Crfs {
    /// Build the tree. The `rootfs` layer, if configured, is opened now so a
    /// broken archive fails before anything is mounted.
    pub fn new(config: Config) -> Result<Crfs> {
        let rootfs = match &config.rootfs {
            Some(name) => Some(node::open_layer(&config.layers_dir.join(name))?),
            None => None,
        };
        let root = Node::root(config.layers_dir, rootfs)?;
        Ok(Crfs {
            root: Arc::new(root),
        })
    }

    #[inline(always)]
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }
}

/// Lock a mutex, ignoring poisoning. Guarded state is only ever replaced whole.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
