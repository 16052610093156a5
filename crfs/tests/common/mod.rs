#![allow(dead_code)]

use std::path::Path;

use stargz::Writer;
use tempfile::TempDir;

pub const HELLO: &[u8] = b"hello";

pub enum Member<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
    Xattr(&'a str, &'a str, &'a [u8]),
}

fn header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_mtime(1_550_000_000);
    header
}

pub fn tar_of(members: &[Member<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for member in members {
        match member {
            Member::Dir(path) => {
                let mut h = header(tar::EntryType::Directory, 0o755, 0);
                builder.append_data(&mut h, path, std::io::empty()).unwrap();
            }
            Member::File(path, data) => {
                let mut h = header(tar::EntryType::Regular, 0o644, data.len() as u64);
                builder.append_data(&mut h, path, *data).unwrap();
            }
            Member::Symlink(path, target) => {
                let mut h = header(tar::EntryType::Symlink, 0o777, 0);
                builder.append_link(&mut h, path, target).unwrap();
            }
            Member::Xattr(path, name, value) => {
                let key = format!("SCHILY.xattr.{name}");
                builder
                    .append_pax_extensions([(key.as_str(), *value)])
                    .unwrap();
                let mut h = header(tar::EntryType::Directory, 0o755, 0);
                builder.append_data(&mut h, path, std::io::empty()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// Write `members` as a stargz layer named `name` under `dir`.
pub fn write_layer(dir: &Path, name: &str, members: &[Member<'_>], chunk_size: u64) {
    let file = std::fs::File::create(dir.join(name)).unwrap();
    let mut writer = Writer::new(file).with_chunk_size(chunk_size);
    writer.append_tar(&tar_of(members)[..]).unwrap();
    writer.close().unwrap();
}

/// A layers directory holding the overlay sample as `hello.stargz`.
pub fn layers_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_layer(
        dir.path(),
        "hello.stargz",
        &[
            Member::Dir("dir"),
            Member::File("dir/a.txt", HELLO),
            Member::File("dir/.wh.b.txt", b""),
            Member::File("dir/.wh.c.txt", b""),
            Member::File("dir/c.txt", b"kept"),
            Member::Dir("opaque"),
            Member::File("opaque/.wh..wh..opq", b""),
            Member::File("opaque/inner", b"x"),
            Member::Xattr("tagged", "user.color", b"blue"),
            Member::Symlink("link", "dir/a.txt"),
        ],
        2,
    );
    dir
}
