//! Lazily assigned, process-wide unique inode numbers.
//!
//! The counter is shared by every mount in the process and never reset.
//! Numbers are 32-bit, leaving the upper half of the kernel's 64-bit inode
//! space to stacked overlay mounts. Wrap-around is not handled.

use std::sync::atomic::{AtomicU32, Ordering};

/// The kernel's fixed inode for the mount root.
pub const ROOT_INODE: u32 = 1;

static NEXT_INODE: AtomicU32 = AtomicU32::new(ROOT_INODE);

/// Take a fresh number from the shared counter. Never returns zero.
pub fn next_inode() -> u32 {
    loop {
        let ino = NEXT_INODE.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if ino != 0 {
            return ino;
        }
    }
}

/// A per-node inode slot, filled on first use.
#[derive(Debug, Default)]
pub struct LazyInode(AtomicU32);

impl LazyInode {
    pub const fn new() -> LazyInode {
        LazyInode(AtomicU32::new(0))
    }

    /// A slot holding a number reserved earlier, e.g. while listing a directory.
    pub const fn preset(ino: u32) -> LazyInode {
        LazyInode(AtomicU32::new(ino))
    }

    pub fn get(&self) -> u32 {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current != 0 {
                return current;
            }
            let fresh = next_inode();
            match self
                .0
                .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return fresh,
                // Somebody else claimed the slot first; their number wins.
                Err(_) => continue,
            }
        }
    }
}
