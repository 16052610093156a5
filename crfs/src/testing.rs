use std::sync::Arc;

use stargz::{Reader, Writer};

pub(crate) enum Member<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
}

impl<'a> Member<'a> {
    pub(crate) fn dir(path: &'a str) -> Self {
        Member::Dir(path)
    }

    pub(crate) fn file(path: &'a str, data: &'a [u8]) -> Self {
        Member::File(path, data)
    }

    pub(crate) fn symlink(path: &'a str, target: &'a str) -> Self {
        Member::Symlink(path, target)
    }
}

pub(crate) fn tar_of(members: &[Member<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for member in members {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(1_550_000_000);
        header.set_uid(0);
        header.set_gid(0);
        match member {
            Member::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .unwrap();
            }
            Member::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, *data).unwrap();
            }
            Member::Symlink(path, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, path, target).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

pub(crate) fn layer_with_chunk_size(members: &[Member<'_>], chunk_size: u64) -> Arc<Reader> {
    let mut blob = Vec::new();
    let mut writer = Writer::new(&mut blob).with_chunk_size(chunk_size);
    writer.append_tar(&tar_of(members)[..]).unwrap();
    let size = writer.close().unwrap();
    Arc::new(Reader::open(blob, size).unwrap())
}

pub(crate) fn layer(members: &[Member<'_>]) -> Arc<Reader> {
    layer_with_chunk_size(members, stargz::DEFAULT_CHUNK_SIZE)
}
