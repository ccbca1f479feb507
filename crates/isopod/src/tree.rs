//! The in-memory filesystem tree: the shape both a freshly opened image
//! and a caller's pending mutations are represented as, independent of
//! how it will eventually be laid out on disk.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use crate::codec;
use crate::directory::{DirectoryRecord, FileFlags, Identifier, SECTOR_SIZE};
use crate::error::Error;
use crate::rockridge::{self, ContinuationSource, RockRidgeAttributes};
use crate::{Extensions, Result};

/// Where a file's bytes live: already on the source image, or staged in
/// memory by a pending `add_file`/`write_file` call.
///
/// `OnImage` carries one `(extent_location, length)` pair per directory
/// record in the file's chain; a plain file has exactly one. A file
/// recorded as a `MULTI_EXTENT` chain has several, in on-disk order.
#[derive(Debug, Clone)]
pub enum FileData {
    OnImage { extents: Vec<(u32, u32)> },
    Bytes(Vec<u8>),
}

impl FileData {
    pub fn len(&self) -> u64 {
        match self {
            FileData::OnImage { extents } => extents.iter().map(|(_, len)| *len as u64).sum(),
            FileData::Bytes(bytes) => bytes.len() as u64,
        }
    }

    /// The extent a reference to this file (e.g. an El Torito boot catalog
    /// entry's load RBA) points at: the first extent in the chain.
    pub fn first_extent_location(&self) -> Option<u32> {
        match self {
            FileData::OnImage { extents } => extents.first().map(|(loc, _)| *loc),
            FileData::Bytes(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Content {
    Directory(BTreeMap<String, TreeEntry>),
    File(FileData),
    /// A Rock Ridge symbolic link; never has data of its own.
    Symlink(String),
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub recording_time: codec::RecordTimestamp,
    pub posix: Option<rockridge::PosixAttributes>,
    pub hidden: bool,
    pub content: Content,
}

impl TreeEntry {
    pub fn is_directory(&self) -> bool {
        matches!(self.content, Content::Directory(_))
    }

    pub fn new_directory() -> Self {
        Self {
            recording_time: codec::RecordTimestamp::now(),
            posix: None,
            hidden: false,
            content: Content::Directory(BTreeMap::new()),
        }
    }

    pub fn new_file(data: FileData) -> Self {
        Self {
            recording_time: codec::RecordTimestamp::now(),
            posix: None,
            hidden: false,
            content: Content::File(data),
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, TreeEntry>> {
        match &self.content {
            Content::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, TreeEntry>> {
        match &mut self.content {
            Content::Directory(children) => Some(children),
            _ => None,
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

impl TreeEntry {
    /// Look up a `/`-separated path relative to this entry, which must be
    /// a directory.
    pub fn lookup(&self, path: &str) -> Result<&TreeEntry> {
        let mut current = self;
        for component in split_path(path) {
            let children = current.children().ok_or_else(|| {
                Error::lookup(path.to_string(), crate::error::LookupReason::NotADirectory)
            })?;
            current = children
                .get(component)
                .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotFound))?;
        }
        Ok(current)
    }

    /// Insert `entry` at `path`, creating no intermediate directories —
    /// the parent must already exist.
    pub fn insert(&mut self, path: &str, entry: TreeEntry) -> Result<()> {
        let components = split_path(path);
        let (name, parents) = components
            .split_last()
            .ok_or_else(|| Error::argument("cannot insert at the empty path"))?;
        let mut current = self;
        for component in parents {
            current = current
                .children_mut()
                .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotADirectory))?
                .get_mut(*component)
                .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotFound))?;
        }
        let children = current
            .children_mut()
            .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotADirectory))?;
        if children.contains_key(*name) {
            return Err(Error::argument(format!("`{path}` already exists")));
        }
        children.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<TreeEntry> {
        let components = split_path(path);
        let (name, parents) = components
            .split_last()
            .ok_or_else(|| Error::argument("cannot remove the root"))?;
        let mut current = self;
        for component in parents {
            current = current
                .children_mut()
                .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotADirectory))?
                .get_mut(*component)
                .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotFound))?;
        }
        current
            .children_mut()
            .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotADirectory))?
            .remove(*name)
            .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotFound))
    }
}

/// Read the raw bytes of one extent from a `Read + Seek` source.
pub(crate) fn read_extent<S: Read + Seek>(source: &mut S, extent_location: u32, length: u32) -> Result<Vec<u8>> {
    let sector_count = crate::extent::sectors_for(length as u64).max(1);
    let mut buf = vec![0u8; sector_count as usize * SECTOR_SIZE];
    source.seek(SeekFrom::Start(extent_location as u64 * SECTOR_SIZE as u64))?;
    source.read_exact(&mut buf)?;
    Ok(buf)
}

struct SourceContinuation<'a, S> {
    source: &'a mut S,
}

impl<'a, S: Read + Seek> ContinuationSource for SourceContinuation<'a, S> {
    fn read_continuation(&mut self, extent: u32, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.source.seek(SeekFrom::Start(
            extent as u64 * SECTOR_SIZE as u64 + offset as u64,
        ))?;
        let mut buf = vec![0u8; len as usize];
        self.source.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn resolve_rock_ridge<S: Read + Seek>(
    source: &mut S,
    record: &DirectoryRecord,
) -> Result<RockRidgeAttributes> {
    let mut continuation = SourceContinuation { source };
    let entries = rockridge::resolve_entries("rock_ridge", &record.system_use, &mut continuation)?;
    rockridge::assemble_attributes("rock_ridge", &entries)
}

/// Read one directory's full record list (including deep-relocated
/// children, transparently followed via `CL`), recursing into
/// subdirectories to build the in-memory tree.
fn read_directory<S: Read + Seek>(
    source: &mut S,
    dir_record: &DirectoryRecord,
    extensions: Extensions,
    joliet: bool,
    depth: u32,
) -> Result<BTreeMap<String, TreeEntry>> {
    let buf = read_extent(source, dir_record.extent_location, dir_record.data_length)?;
    let records = crate::directory::read_directory_records("directory", &buf)?;
    let mut children = BTreeMap::new();

    let mut i = 0;
    while i < records.len() {
        let record = &records[i];
        if matches!(record.identifier, Identifier::SelfEntry | Identifier::ParentEntry) {
            i += 1;
            continue;
        }
        let identifier_name = match (&record.identifier, joliet) {
            (Identifier::Named(bytes), true) => crate::joliet::decode_identifier("directory", bytes)?,
            _ => record.identifier.name_without_version(),
        };

        let rr = if extensions.contains(Extensions::ROCK_RIDGE) && !joliet {
            Some(resolve_rock_ridge(source, record)?)
        } else {
            None
        };

        if let Some(rr) = &rr {
            if rr.is_relocation_placeholder {
                // Represented at its real parent via that parent's CL
                // entry; skip it here so it isn't listed twice.
                i += 1;
                continue;
            }
        }

        let name = rr
            .as_ref()
            .and_then(|rr| rr.name.clone())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or(identifier_name);

        let effective_extent = rr
            .as_ref()
            .and_then(|rr| rr.relocated_child)
            .unwrap_or(record.extent_location);

        let recording_time = record.recording_time;
        let posix = rr.as_ref().and_then(|rr| rr.posix);
        let hidden = record.flags.contains(FileFlags::HIDDEN);
        let is_directory = record.is_directory();

        let mut consumed = 1;
        let content = if let Some(target) = rr.as_ref().and_then(|rr| rr.symlink_target.clone()) {
            Content::Symlink(render_symlink(&target))
        } else if is_directory {
            if depth + 1 > crate::constants::MAX_PATH_DEPTH as u32 && !extensions.contains(Extensions::ROCK_RIDGE)
            {
                return Err(Error::format(
                    "directory",
                    "directory nesting exceeds the level 1-3 depth limit without Rock Ridge relocation",
                ));
            }
            let mut relocated_record = record.clone();
            relocated_record.extent_location = effective_extent;
            let grandchildren = read_directory(source, &relocated_record, extensions, joliet, depth + 1)?;
            Content::Directory(grandchildren)
        } else {
            // A MULTI_EXTENT file is a run of consecutive records sharing
            // this identifier, all but the last flagged MULTI_EXTENT;
            // concatenate them into one logical file.
            let mut extents = vec![(effective_extent, record.data_length)];
            let mut j = i;
            while records[j].flags.contains(FileFlags::MULTI_EXTENT) {
                j += 1;
                if j >= records.len() {
                    return Err(Error::format("directory", "MULTI_EXTENT chain runs past the last record"));
                }
                extents.push((records[j].extent_location, records[j].data_length));
            }
            consumed = j - i + 1;
            Content::File(FileData::OnImage { extents })
        };

        children.insert(
            name,
            TreeEntry {
                recording_time,
                posix,
                hidden,
                content,
            },
        );
        i += consumed;
    }

    Ok(children)
}

fn render_symlink(components: &[rockridge::LinkComponent]) -> String {
    use rockridge::LinkComponent;
    let parts: Vec<String> = components
        .iter()
        .map(|c| match c {
            LinkComponent::Current => ".".to_string(),
            LinkComponent::Parent => "..".to_string(),
            LinkComponent::Root => String::new(),
            LinkComponent::Named(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        })
        .collect();
    parts.join("/")
}

/// Read an entire directory tree rooted at `root_record`, which must be
/// the root directory record out of a Primary (or Joliet Supplementary)
/// Volume Descriptor.
pub fn read_tree<S: Read + Seek>(
    source: &mut S,
    root_record: &DirectoryRecord,
    extensions: Extensions,
    joliet: bool,
) -> Result<TreeEntry> {
    let children = read_directory(source, root_record, extensions, joliet, 0)?;
    Ok(TreeEntry {
        recording_time: root_record.recording_time,
        posix: None,
        hidden: false,
        content: Content::Directory(children),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(children: BTreeMap<String, TreeEntry>) -> TreeEntry {
        TreeEntry {
            recording_time: codec::RecordTimestamp::now(),
            posix: None,
            hidden: false,
            content: Content::Directory(children),
        }
    }

    #[test]
    fn insert_and_lookup_nested_path() {
        let mut root = dir(BTreeMap::new());
        root.insert("docs", TreeEntry::new_directory()).unwrap();
        root.insert(
            "docs/readme.txt",
            TreeEntry::new_file(FileData::Bytes(b"hi".to_vec())),
        )
        .unwrap();
        let found = root.lookup("docs/readme.txt").unwrap();
        assert_eq!(found.content_len(), 2);
    }

    #[test]
    fn lookup_missing_path_errors() {
        let root = dir(BTreeMap::new());
        assert!(root.lookup("nope").is_err());
    }

    #[test]
    fn remove_detaches_entry() {
        let mut root = dir(BTreeMap::new());
        root.insert("a", TreeEntry::new_directory()).unwrap();
        root.remove("a").unwrap();
        assert!(root.lookup("a").is_err());
    }

    impl TreeEntry {
        fn content_len(&self) -> u64 {
            match &self.content {
                Content::File(data) => data.len(),
                _ => 0,
            }
        }
    }

    fn write_record(buf: &mut Vec<u8>, record: &DirectoryRecord) {
        let len = record.serialized_len();
        let mut rec_buf = vec![0u8; len];
        record.write(&mut rec_buf).unwrap();
        buf.extend_from_slice(&rec_buf);
    }

    fn sample_record(identifier: Identifier, extent_location: u32, data_length: u32, flags: FileFlags) -> DirectoryRecord {
        DirectoryRecord {
            extended_attribute_length: 0,
            extent_location,
            data_length,
            recording_time: codec::RecordTimestamp::now(),
            flags,
            file_unit_size: 0,
            interleave_gap_size: 0,
            volume_sequence_number: 1,
            identifier,
            system_use: Vec::new(),
        }
    }

    #[test]
    fn multi_extent_chain_concatenates_into_one_file() {
        let mut buf = Vec::new();
        write_record(&mut buf, &sample_record(Identifier::SelfEntry, 0, 2048, FileFlags::DIRECTORY));
        write_record(&mut buf, &sample_record(Identifier::ParentEntry, 0, 2048, FileFlags::DIRECTORY));
        write_record(
            &mut buf,
            &sample_record(
                Identifier::Named(b"FILE.TXT;1".to_vec()),
                10,
                100,
                FileFlags::MULTI_EXTENT,
            ),
        );
        write_record(
            &mut buf,
            &sample_record(Identifier::Named(b"FILE.TXT;1".to_vec()), 11, 50, FileFlags::empty()),
        );
        buf.resize(2048, 0);

        let mut source = std::io::Cursor::new(buf);
        let root_record = sample_record(Identifier::SelfEntry, 0, 2048, FileFlags::DIRECTORY);
        let tree = read_tree(&mut source, &root_record, Extensions::empty(), false).unwrap();
        let children = tree.children().unwrap();
        assert_eq!(children.len(), 1);
        let file = &children["FILE.TXT"];
        assert_eq!(file.content_len(), 150);
        match &file.content {
            Content::File(FileData::OnImage { extents }) => {
                assert_eq!(extents, &vec![(10, 100), (11, 50)]);
            }
            _ => panic!("expected an on-image file"),
        }
    }
}
