//! Overlay-compatible directory listings of archive directories.

use std::collections::HashSet;

use stargz::EntryId;

use crate::attr::DirentType;
use crate::overlay::{OPAQUE_MARKER, WHITEOUT_PREFIX, whiteout_target};

/// One entry of a listing returned to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    pub kind: DirentType,
    pub name: String,
}

/// A visible child of an archive directory, before inodes are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merged<'a> {
    pub name: &'a str,
    pub kind: DirentType,
    /// The entry the child is backed by: the child itself, or for a
    /// synthesized whiteout the `.wh.` entry that produced it.
    pub source: EntryId,
}

/// Merge a directory's children the way overlayfs expects a layer to look.
///
/// The opaque marker is dropped. `.wh.<name>` entries are not shown
/// themselves; instead `<name>` is listed as a character device unless a real
/// `<name>` exists alongside. The result is sorted by name.
pub fn merge<'a>(dir: &stargz::Entry<'a>) -> Vec<Merged<'a>> {
    let mut listing = Vec::with_capacity(dir.child_count());
    let mut shown = HashSet::new();
    let mut hidden = Vec::new();

    for (name, child) in dir.children() {
        if name == OPAQUE_MARKER {
            continue;
        }
        if name.starts_with(WHITEOUT_PREFIX) {
            match whiteout_target(name) {
                Some(target) if target.starts_with(WHITEOUT_PREFIX) => {
                    tracing::debug!(name, "crfs: ignoring whiteout of a whiteout name")
                }
                Some(target) => hidden.push((target, child.id())),
                None => tracing::debug!(name, "crfs: ignoring whiteout without a target"),
            }
            continue;
        }

        shown.insert(name);
        listing.push(Merged {
            name,
            kind: DirentType::from(child.kind),
            source: child.id(),
        });
    }

    for (target, source) in hidden {
        if shown.contains(target) {
            continue;
        }
        tracing::trace!(dir = %dir.name, target, "crfs: synthesizing whiteout");
        listing.push(Merged {
            name: target,
            kind: DirentType::CharDevice,
            source,
        });
    }

    listing.sort_unstable_by(|a, b| a.name.cmp(b.name));
    listing
}
