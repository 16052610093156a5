//! Overlay filesystem naming conventions carried by container layers.

/// Prefix marking a path as deleted relative to lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Child name marking its parent directory as opaque.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Extended attribute overlayfs reads to detect an opaque directory.
pub const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

pub const OPAQUE_XATTR_VALUE: &[u8] = b"y";

/// The name a whiteout entry hides, or `None` if `name` is not a whiteout.
/// The opaque marker is not a whiteout of anything.
pub fn whiteout_target(name: &str) -> Option<&str> {
    if name == OPAQUE_MARKER {
        return None;
    }
    name.strip_prefix(WHITEOUT_PREFIX)
        .filter(|target| !target.is_empty())
}

pub fn whiteout_name(target: &str) -> String {
    format!("{WHITEOUT_PREFIX}{target}")
}

/// Whether a directory entry carries the opaque marker among its children.
pub fn is_opaque(entry: &stargz::Entry<'_>) -> bool {
    entry.is_dir() && entry.lookup_child(OPAQUE_MARKER).is_some()
}
