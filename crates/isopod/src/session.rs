//! The public session API: `Iso<S>`, the NEW/OPEN/CLOSED state machine
//! gating reads and writes, and the layout engine that turns an in-memory
//! tree back into an ECMA-119 image.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;

use crate::codec::{self, VolumeTimestamp};
use crate::directory::{DirectoryRecord, FileFlags, Identifier, SECTOR_SIZE};
use crate::eltorito::{BootCatalog, BootInfoTable, BOOT_RECORD_IDENTIFIER};
use crate::error::Error;
use crate::extent::{Extent, ExtentAllocator};
use crate::path_table::{self, PathTableEntry};
use crate::rockridge::PosixAttributes;
use crate::tree::{self, Content, FileData, TreeEntry};
use crate::volume::{
    BootRecordDescriptor, JolietLevel, PrimaryVolumeDescriptor, SupplementaryVolumeDescriptor,
    VolumeDescriptor, VolumeDescriptorBody,
};
use crate::Result;

bitflags::bitflags! {
    /// Which extensions a session reads, and which it writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Extensions: u8 {
        const ROCK_RIDGE = 1 << 0;
        const JOLIET = 1 << 1;
        const EL_TORITO = 1 << 2;
        const XA = 1 << 3;
    }
}

/// Descriptive metadata written into the Primary (and, if enabled,
/// Supplementary) Volume Descriptor.
#[derive(Debug, Clone)]
pub struct WriterMetadata {
    pub system_identifier: String,
    pub volume_identifier: String,
    pub volume_set_identifier: String,
    pub publisher_identifier: String,
    pub data_preparer_identifier: String,
    pub application_identifier: String,
}

impl Default for WriterMetadata {
    fn default() -> Self {
        Self {
            system_identifier: String::new(),
            volume_identifier: "ISOPOD".to_string(),
            volume_set_identifier: String::new(),
            publisher_identifier: String::new(),
            data_preparer_identifier: String::new(),
            application_identifier: "ISOPOD".to_string(),
        }
    }
}

/// Boot configuration for an El Torito image: the path of the already
/// in-tree boot file, whether to patch its Boot Info Table, and the
/// emulation/platform it should be cataloged under.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub boot_file_path: String,
    pub platform_id: crate::eltorito::PlatformId,
    pub emulation: crate::eltorito::Emulation,
    pub patch_boot_info_table: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Open,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::New => "new",
            State::Open => "open",
            State::Closed => "closed",
        }
    }
}

/// An ISO 9660 session: a readable/writable tree plus the extensions and
/// metadata governing how it serializes.
pub struct Iso<S> {
    state: State,
    source: Option<S>,
    extensions: Extensions,
    pub metadata: WriterMetadata,
    root: TreeEntry,
    boot: Option<BootConfig>,
}

/// What kind of directory entry `get_entry`/`list_dir` describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub kind: EntryKind,
    pub size: u64,
    pub recording_time: codec::RecordTimestamp,
    pub posix: Option<PosixAttributes>,
}

impl<S> Iso<S> {
    /// Start a brand-new, empty image (state `New`); nothing has been
    /// read, and `write` can be called immediately.
    pub fn create(extensions: Extensions) -> Self {
        Self {
            state: State::Open,
            source: None,
            extensions,
            metadata: WriterMetadata::default(),
            root: TreeEntry::new_directory(),
            boot: None,
        }
    }

    fn require_open(&self) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::state("open", self.state.name()));
        }
        Ok(())
    }

    pub fn add_directory(&mut self, path: &str) -> Result<()> {
        self.require_open()?;
        self.root.insert(path, TreeEntry::new_directory())
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        self.require_open()?;
        self.root.insert(path, TreeEntry::new_file(FileData::Bytes(data)))
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.require_open()?;
        self.root.remove(path)?;
        Ok(())
    }

    pub fn set_boot_config(&mut self, boot: BootConfig) -> Result<()> {
        self.require_open()?;
        if !self.extensions.contains(Extensions::EL_TORITO) {
            return Err(Error::argument("El Torito extension is not enabled for this session"));
        }
        self.boot = Some(boot);
        Ok(())
    }

    pub fn get_entry(&self, path: &str) -> Result<EntryInfo> {
        self.require_open()?;
        let entry = self.root.lookup(path)?;
        let (kind, size) = match &entry.content {
            Content::Directory(_) => (EntryKind::Directory, 0),
            Content::File(data) => (EntryKind::File, data.len()),
            Content::Symlink(target) => (EntryKind::Symlink, target.len() as u64),
        };
        Ok(EntryInfo {
            kind,
            size,
            recording_time: entry.recording_time,
            posix: entry.posix,
        })
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        self.require_open()?;
        let entry = if path.is_empty() || path == "/" {
            &self.root
        } else {
            self.root.lookup(path)?
        };
        let children = entry
            .children()
            .ok_or_else(|| Error::lookup(path.to_string(), crate::error::LookupReason::NotADirectory))?;
        Ok(children.keys().cloned().collect())
    }

    pub fn close(mut self) -> Result<()> {
        self.require_open()?;
        self.state = State::Closed;
        self.source.take();
        Ok(())
    }
}

/// Read a path table's exact `byte_len` bytes (the reserved extent is
/// sector-padded; the table's own content is not).
fn read_path_table_bytes<S: Read + Seek>(source: &mut S, location: u32, byte_len: u32) -> Result<Vec<u8>> {
    source.seek(SeekFrom::Start(location as u64 * SECTOR_SIZE as u64))?;
    let mut buf = vec![0u8; byte_len as usize];
    source.read_exact(&mut buf)?;
    Ok(buf)
}

/// Breadth-first directory extents as found by following directory records
/// from `root_record`, independent of any on-disk path table — the
/// reference a path table is checked against.
fn directory_record_extents<S: Read + Seek>(source: &mut S, root_record: &DirectoryRecord) -> Result<Vec<u32>> {
    let mut extents = Vec::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(root_record.clone());
    while let Some(record) = queue.pop_front() {
        extents.push(record.extent_location);
        let buf = tree::read_extent(source, record.extent_location, record.data_length)?;
        let records = crate::directory::read_directory_records("path_table", &buf)?;
        for child in records {
            if child.is_directory() && !matches!(child.identifier, Identifier::SelfEntry | Identifier::ParentEntry) {
                queue.push_back(child);
            }
        }
    }
    Ok(extents)
}

/// Parse a volume descriptor body's L and M path tables, check they agree
/// with each other, and check their set of directory extents agrees with
/// what a plain directory-record traversal finds.
fn validate_path_tables<S: Read + Seek>(
    source: &mut S,
    field: &'static str,
    body: &VolumeDescriptorBody,
) -> Result<()> {
    let l_bytes = read_path_table_bytes(source, body.type_l_path_table, body.path_table_size)?;
    let m_bytes = read_path_table_bytes(source, body.type_m_path_table, body.path_table_size)?;
    let l_entries = path_table::parse_path_table(field, &l_bytes, path_table::Endianness::Little)?;
    let m_entries = path_table::parse_path_table(field, &m_bytes, path_table::Endianness::Big)?;
    if !path_table::tables_agree(&l_entries, &m_entries) {
        return Err(Error::format(field, "L and M path tables disagree"));
    }

    let mut tree_extents = directory_record_extents(source, &body.root_directory_record)?;
    tree_extents.sort_unstable();
    let mut table_extents: Vec<u32> = l_entries.iter().map(|e| e.extent_location).collect();
    table_extents.sort_unstable();
    if tree_extents != table_extents {
        return Err(Error::format(
            field,
            "path table directory extents do not match the directory record tree",
        ));
    }
    Ok(())
}

/// Find the image path of the on-image file whose extent is `extent_location`,
/// used to recover a boot file's path from the boot catalog's default entry.
fn find_file_path_by_extent(node: &TreeEntry, path: &str, extent_location: u32) -> Option<String> {
    if let Content::File(data) = &node.content {
        if data.first_extent_location() == Some(extent_location) {
            return Some(path.to_string());
        }
    }
    if let Some(children) = node.children() {
        for (name, child) in children {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            if let Some(found) = find_file_path_by_extent(child, &child_path, extent_location) {
                return Some(found);
            }
        }
    }
    None
}

/// Parse the boot catalog `boot_record` points at (if any) back into a
/// [`BootConfig`], resolving the default entry's load extent to its path in
/// the just-built tree.
fn read_boot_config<S: Read + Seek>(
    source: &mut S,
    boot_record: Option<&BootRecordDescriptor>,
    root: &TreeEntry,
) -> Result<Option<BootConfig>> {
    let Some(record) = boot_record else {
        return Ok(None);
    };
    if record.boot_system_use.len() < 4 {
        return Ok(None);
    }
    let catalog_extent = u32::from_le_bytes(record.boot_system_use[0..4].try_into().unwrap());
    let catalog_buf = tree::read_extent(source, catalog_extent, SECTOR_SIZE as u32)?;
    let catalog = BootCatalog::parse(&catalog_buf)?;
    let boot_file_path = find_file_path_by_extent(root, "", catalog.default.load_rba);
    Ok(boot_file_path.map(|boot_file_path| BootConfig {
        boot_file_path,
        platform_id: catalog.validation.platform_id,
        emulation: catalog.default.emulation,
        // Whether the boot file's content was patched with a Boot Info
        // Table is not recorded anywhere but the file's own bytes, which
        // the catalog does not expose; re-patching is opt-in again on the
        // reopened session.
        patch_boot_info_table: false,
    }))
}

impl<S: Read + Seek> Iso<S> {
    /// Open an existing image, reading its Volume Descriptor Set and
    /// building the in-memory tree from either the Joliet Supplementary
    /// Volume Descriptor (if requested and present) or the Primary.
    pub fn open(mut source: S, extensions: Extensions) -> Result<Self> {
        source.seek(SeekFrom::Start(16 * SECTOR_SIZE as u64))?;
        let mut primary: Option<PrimaryVolumeDescriptor> = None;
        let mut joliet: Option<SupplementaryVolumeDescriptor> = None;
        let mut boot_record: Option<BootRecordDescriptor> = None;
        let mut block = vec![0u8; SECTOR_SIZE];

        loop {
            source.read_exact(&mut block)?;
            let descriptor = VolumeDescriptor::parse(&block)?;
            match descriptor {
                VolumeDescriptor::Terminator => break,
                VolumeDescriptor::Primary(pvd) => {
                    if primary.is_some() {
                        return Err(Error::format(
                            "volume_descriptor_set",
                            "more than one Primary Volume Descriptor",
                        ));
                    }
                    primary = Some(pvd);
                }
                VolumeDescriptor::Supplementary(svd) => {
                    if svd.joliet_level.is_some() {
                        joliet = Some(svd);
                    }
                }
                VolumeDescriptor::BootRecord(record) => {
                    boot_record = Some(record);
                }
                VolumeDescriptor::Opaque { .. } => {}
            }
        }

        let primary = primary.ok_or_else(|| {
            Error::format("volume_descriptor_set", "no Primary Volume Descriptor found")
        })?;

        validate_path_tables(&mut source, "path_table.iso", &primary.0)?;
        if let Some(joliet_svd) = &joliet {
            validate_path_tables(&mut source, "path_table.joliet", &joliet_svd.body)?;
        }

        let use_joliet = extensions.contains(Extensions::JOLIET) && joliet.is_some();
        let root_record = if use_joliet {
            joliet.as_ref().unwrap().body.root_directory_record.clone()
        } else {
            primary.0.root_directory_record.clone()
        };

        debug!(
            "opening image: using {} tree, volume id `{}`",
            if use_joliet { "Joliet" } else { "ISO" },
            primary.0.volume_identifier
        );

        let root = tree::read_tree(&mut source, &root_record, extensions, use_joliet)?;

        let boot = if extensions.contains(Extensions::EL_TORITO) {
            read_boot_config(&mut source, boot_record.as_ref(), &root)?
        } else {
            None
        };

        Ok(Self {
            state: State::Open,
            source: Some(source),
            extensions,
            metadata: WriterMetadata {
                system_identifier: primary.0.system_identifier.clone(),
                volume_identifier: primary.0.volume_identifier.clone(),
                volume_set_identifier: primary.0.volume_set_identifier.clone(),
                publisher_identifier: primary.0.publisher_identifier.clone(),
                data_preparer_identifier: primary.0.data_preparer_identifier.clone(),
                application_identifier: primary.0.application_identifier.clone(),
            },
            root,
            boot,
        })
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.require_open()?;
        let entry = self.root.lookup(path)?.clone();
        let data = match entry.content {
            Content::File(data) => data,
            Content::Directory(_) => {
                return Err(Error::lookup(path.to_string(), crate::error::LookupReason::IsADirectory))
            }
            Content::Symlink(target) => return Ok(target.into_bytes()),
        };
        match data {
            FileData::Bytes(bytes) => Ok(bytes),
            FileData::OnImage { extents } => {
                let source = self
                    .source
                    .as_mut()
                    .ok_or_else(|| Error::state("open with backing source", "open without a source"))?;
                let mut out = Vec::with_capacity(extents.iter().map(|(_, len)| *len as usize).sum());
                for (extent_location, length) in extents {
                    source.seek(SeekFrom::Start(extent_location as u64 * SECTOR_SIZE as u64))?;
                    let mut buf = vec![0u8; length as usize];
                    source.read_exact(&mut buf)?;
                    out.extend_from_slice(&buf);
                }
                Ok(out)
            }
        }
    }

    pub fn write_file_to<W: Write>(&mut self, path: &str, dest: &mut W) -> Result<()> {
        let bytes = self.read_file(path)?;
        dest.write_all(&bytes)?;
        Ok(())
    }
}

// --- Write path -------------------------------------------------------

trait NameScheme {
    fn encode_name(&self, real_name: &str, is_dir: bool) -> Vec<u8>;
    fn system_use(&self, entry: &TreeEntry, real_name: &str) -> Vec<u8>;
}

struct IsoScheme {
    rock_ridge: bool,
}

fn push_susp_entry(buf: &mut Vec<u8>, signature: &[u8; 2], data: &[u8]) {
    buf.extend_from_slice(signature);
    buf.push((4 + data.len()) as u8);
    buf.push(1);
    buf.extend_from_slice(data);
}

impl NameScheme for IsoScheme {
    fn encode_name(&self, real_name: &str, is_dir: bool) -> Vec<u8> {
        let filtered: String = real_name
            .to_ascii_uppercase()
            .chars()
            .map(|c| if codec::is_d_character(c as u8) { c } else { '_' })
            .collect();
        if is_dir {
            filtered.into_bytes()
        } else {
            format!("{filtered};1").into_bytes()
        }
    }

    fn system_use(&self, entry: &TreeEntry, real_name: &str) -> Vec<u8> {
        if !self.rock_ridge {
            return Vec::new();
        }
        let mut buf = Vec::new();
        let posix = entry.posix.unwrap_or(PosixAttributes {
            mode: if entry.is_directory() { 0o040755 } else { 0o100644 },
            links: 1,
            uid: 0,
            gid: 0,
            serial_number: None,
        });
        let mut px_data = vec![0u8; 32];
        codec::write_u32_lsb_msb(&mut px_data[0..8], posix.mode);
        codec::write_u32_lsb_msb(&mut px_data[8..16], posix.links);
        codec::write_u32_lsb_msb(&mut px_data[16..24], posix.uid);
        codec::write_u32_lsb_msb(&mut px_data[24..32], posix.gid);
        push_susp_entry(&mut buf, b"PX", &px_data);

        let mut nm_data = vec![0u8];
        nm_data.extend_from_slice(real_name.as_bytes());
        push_susp_entry(&mut buf, b"NM", &nm_data);

        let mut tf_data = vec![0x02u8]; // MODIFY only, short form
        let mut ts = vec![0u8; 7];
        entry.recording_time.write(&mut ts);
        tf_data.extend_from_slice(&ts);
        push_susp_entry(&mut buf, b"TF", &tf_data);

        buf
    }
}

struct JolietScheme;

impl NameScheme for JolietScheme {
    fn encode_name(&self, real_name: &str, _is_dir: bool) -> Vec<u8> {
        crate::joliet::encode_identifier(real_name)
    }

    fn system_use(&self, _entry: &TreeEntry, _real_name: &str) -> Vec<u8> {
        Vec::new()
    }
}

fn directory_record_len(identifier_len: usize, system_use_len: usize) -> usize {
    let mut len = 33 + identifier_len;
    if identifier_len % 2 == 0 {
        len += 1;
    }
    len + system_use_len
}

/// Simulate the same greedy sector-packing [`crate::directory::read_directory_records`]
/// expects on read, returning the sector count a directory's records
/// would occupy.
fn pack_into_sectors(record_lens: &[usize]) -> u32 {
    let mut sectors = 1u32;
    let mut used = 0usize;
    for &len in record_lens {
        if used + len > SECTOR_SIZE {
            sectors += 1;
            used = 0;
        }
        used += len;
    }
    sectors
}

fn collect_file_extents(
    node: &TreeEntry,
    path: &str,
    allocator: &mut ExtentAllocator,
    extents: &mut BTreeMap<String, Extent>,
) {
    if let Some(children) = node.children() {
        for (name, child) in children {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            match &child.content {
                Content::File(data) => {
                    let extent = allocator.allocate_bytes(data.len());
                    extents.insert(child_path, extent);
                }
                Content::Directory(_) => collect_file_extents(child, &child_path, allocator, extents),
                Content::Symlink(_) => {}
            }
        }
    }
}

/// The largest byte length a single directory record's data length field
/// can carry, rounded down to a whole number of sectors so a following
/// extent in the same chain always starts on a sector boundary.
const MAX_EXTENT_CHUNK_LEN: u64 = (u32::MAX as u64 / SECTOR_SIZE as u64) * SECTOR_SIZE as u64;

/// Split a file's total length into the per-record chunks a `MULTI_EXTENT`
/// chain needs: every chunk but the last is exactly `MAX_EXTENT_CHUNK_LEN`
/// bytes, the last holds whatever remains (zero-length files still get one
/// record of length zero).
fn file_chunk_lengths(total_len: u64) -> Vec<u64> {
    if total_len <= MAX_EXTENT_CHUNK_LEN {
        return vec![total_len];
    }
    let mut lens = Vec::new();
    let mut remaining = total_len;
    while remaining > MAX_EXTENT_CHUNK_LEN {
        lens.push(MAX_EXTENT_CHUNK_LEN);
        remaining -= MAX_EXTENT_CHUNK_LEN;
    }
    lens.push(remaining);
    lens
}

/// Lay `total_len` bytes worth of chunks out over `extent`'s contiguous
/// sectors, returning `(extent_location, data_length, is_multi_extent)`
/// per record in on-disk order.
fn file_record_chunks(extent: Extent, total_len: u64) -> Vec<(u32, u32, bool)> {
    let lens = file_chunk_lengths(total_len);
    let last = lens.len() - 1;
    let mut sector_offset = 0u32;
    lens.into_iter()
        .enumerate()
        .map(|(i, len)| {
            let location = extent.location + sector_offset;
            sector_offset += crate::extent::sectors_for(len);
            (location, len as u32, i != last)
        })
        .collect()
}

fn data_length(entry: &TreeEntry) -> u64 {
    match &entry.content {
        Content::File(data) => data.len(),
        _ => 0,
    }
}

fn compute_dir_sectors(
    node: &TreeEntry,
    path: &str,
    scheme: &dyn NameScheme,
    sizes: &mut BTreeMap<String, u32>,
) {
    let children = node.children().expect("compute_dir_sectors called on a non-directory");
    let mut lens = vec![
        directory_record_len(1, 0), // "."
        directory_record_len(1, 0), // ".."
    ];
    for (name, child) in children {
        let is_dir = child.is_directory();
        let id_len = scheme.encode_name(name, is_dir).len();
        let sua_len = scheme.system_use(child, name).len();
        let record_count = if is_dir { 1 } else { file_chunk_lengths(data_length(child)).len() };
        for _ in 0..record_count {
            lens.push(directory_record_len(id_len, sua_len));
        }
        if is_dir {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            compute_dir_sectors(child, &child_path, scheme, sizes);
        }
    }
    sizes.insert(path.to_string(), pack_into_sectors(&lens));
}

/// Sum of every directory's path table entry length (root entry included),
/// computed the same way [`compute_dir_sectors`] sizes directory records:
/// by walking the tree once, before any extent is assigned.
fn path_table_byte_size(node: &TreeEntry, scheme: &dyn NameScheme) -> usize {
    fn entry_len(id_len: usize) -> usize {
        let id_len = id_len.max(1);
        8 + id_len + (id_len % 2)
    }

    fn walk(node: &TreeEntry, scheme: &dyn NameScheme, total: &mut usize) {
        if let Some(children) = node.children() {
            for (name, child) in children {
                if child.is_directory() {
                    *total += entry_len(scheme.encode_name(name, true).len());
                    walk(child, scheme, total);
                }
            }
        }
    }

    let mut total = entry_len(1); // root entry, identifier is a single 0x00 byte
    walk(node, scheme, &mut total);
    total
}

fn assign_dir_extents(
    root: &TreeEntry,
    sizes: &BTreeMap<String, u32>,
    allocator: &mut ExtentAllocator,
) -> BTreeMap<String, Extent> {
    let mut extents = BTreeMap::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((String::new(), root));
    while let Some((path, node)) = queue.pop_front() {
        let sectors = sizes[&path];
        extents.insert(path.clone(), allocator.allocate(sectors));
        if let Some(children) = node.children() {
            for (name, child) in children {
                if child.is_directory() {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}/{name}")
                    };
                    queue.push_back((child_path, child));
                }
            }
        }
    }
    extents
}

impl<S: Read + Seek> Iso<S> {
    /// Lay out and serialize the whole image: the system area, the
    /// Volume Descriptor Set, path tables, directory trees (ISO and,
    /// if enabled, Joliet), file data, and the El Torito boot catalog.
    /// `target` is independent of the session's own backing source, so a
    /// session opened from one stream can be written out to another.
    /// `progress` is called once per sector actually written to `target`,
    /// with the cumulative and total byte counts.
    pub fn write<W: Write + Seek>(
        &mut self,
        target: &mut W,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        self.require_open()?;

        let system_area_sectors = 16u32;
        let vds_sectors = 2 + if self.extensions.contains(Extensions::EL_TORITO) && self.boot.is_some() {
            1
        } else {
            0
        } + if self.extensions.contains(Extensions::JOLIET) {
            1
        } else {
            0
        };

        let mut allocator = ExtentAllocator::starting_at(system_area_sectors + vds_sectors);

        // Path tables come right after the Volume Descriptor Set.
        let iso_scheme = IsoScheme {
            rock_ridge: self.extensions.contains(Extensions::ROCK_RIDGE),
        };
        let mut iso_sizes = BTreeMap::new();
        compute_dir_sectors(&self.root, "", &iso_scheme, &mut iso_sizes);

        let joliet_scheme = JolietScheme;
        let mut joliet_sizes = BTreeMap::new();
        if self.extensions.contains(Extensions::JOLIET) {
            compute_dir_sectors(&self.root, "", &joliet_scheme, &mut joliet_sizes);
        }

        let mut file_extents = BTreeMap::new();
        // Reserve space for path tables (4 tables: L/M for ISO, L/M for
        // Joliet if enabled), each sized from the actual entries the tree
        // will produce rather than an estimate, since Joliet's UCS-2BE
        // names can make an entry far larger than an ISO 9660 one.
        let iso_path_table_sectors =
            crate::extent::sectors_for(path_table_byte_size(&self.root, &iso_scheme) as u64).max(1);
        let iso_path_table_l = allocator.allocate(iso_path_table_sectors);
        let iso_path_table_m = allocator.allocate(iso_path_table_sectors);
        let (joliet_path_table_l, joliet_path_table_m) = if self.extensions.contains(Extensions::JOLIET) {
            let joliet_path_table_sectors =
                crate::extent::sectors_for(path_table_byte_size(&self.root, &joliet_scheme) as u64).max(1);
            (
                Some(allocator.allocate(joliet_path_table_sectors)),
                Some(allocator.allocate(joliet_path_table_sectors)),
            )
        } else {
            (None, None)
        };

        let iso_dir_extents = assign_dir_extents(&self.root, &iso_sizes, &mut allocator);
        let joliet_dir_extents = if self.extensions.contains(Extensions::JOLIET) {
            Some(assign_dir_extents(&self.root, &joliet_sizes, &mut allocator))
        } else {
            None
        };

        collect_file_extents(&self.root, "", &mut allocator, &mut file_extents);

        let boot_catalog_extent = if self.extensions.contains(Extensions::EL_TORITO) && self.boot.is_some() {
            Some(allocator.allocate(1))
        } else {
            None
        };

        let total_sectors = allocator.next_free_sector();
        let total_bytes = total_sectors as u64 * SECTOR_SIZE as u64;

        let mut image = vec![0u8; total_bytes as usize];

        write_tree_flat(
            &self.root,
            "",
            "",
            &iso_scheme,
            &iso_dir_extents,
            &file_extents,
            &mut image,
        )?;

        if let Some(joliet_extents) = &joliet_dir_extents {
            write_tree_flat(
                &self.root,
                "",
                "",
                &joliet_scheme,
                joliet_extents,
                &file_extents,
                &mut image,
            )?;
        }

        let root_snapshot = self.root.clone();
        write_file_data(self, &root_snapshot, "", &file_extents, &mut image)?;

        let iso_path_l_entries = build_path_table_entries(&self.root, &iso_dir_extents);
        write_path_table_into(&iso_path_l_entries, path_table::Endianness::Little, iso_path_table_l, &mut image);
        write_path_table_into(&iso_path_l_entries, path_table::Endianness::Big, iso_path_table_m, &mut image);

        let mut joliet_path_entries = None;
        if let (Some(joliet_extents), Some(l), Some(m)) =
            (&joliet_dir_extents, joliet_path_table_l, joliet_path_table_m)
        {
            let entries = build_path_table_entries(&self.root, joliet_extents);
            write_path_table_into(&entries, path_table::Endianness::Little, l, &mut image);
            write_path_table_into(&entries, path_table::Endianness::Big, m, &mut image);
            joliet_path_entries = Some(entries);
        }

        let root_record_iso = root_directory_record(&iso_dir_extents);
        let pvd = PrimaryVolumeDescriptor(VolumeDescriptorBody {
            system_identifier: self.metadata.system_identifier.clone(),
            volume_identifier: self.metadata.volume_identifier.clone(),
            volume_space_size: total_sectors,
            volume_set_size: 1,
            volume_sequence_number: 1,
            logical_block_size: SECTOR_SIZE as u16,
            path_table_size: (iso_path_l_entries.iter().map(|e| path_table_entry_len(e)).sum::<usize>()) as u32,
            type_l_path_table: iso_path_table_l.location,
            optional_type_l_path_table: 0,
            type_m_path_table: iso_path_table_m.location,
            optional_type_m_path_table: 0,
            root_directory_record: root_record_iso,
            volume_set_identifier: self.metadata.volume_set_identifier.clone(),
            publisher_identifier: self.metadata.publisher_identifier.clone(),
            data_preparer_identifier: self.metadata.data_preparer_identifier.clone(),
            application_identifier: self.metadata.application_identifier.clone(),
            copyright_file_identifier: String::new(),
            abstract_file_identifier: String::new(),
            bibliographic_file_identifier: String::new(),
            creation_date_time: VolumeTimestamp::from_datetime(chrono::Utc::now()),
            modification_date_time: VolumeTimestamp::from_datetime(chrono::Utc::now()),
            expiration_date_time: VolumeTimestamp::UNSPECIFIED,
            effective_date_time: VolumeTimestamp::from_datetime(chrono::Utc::now()),
            file_structure_version: 1,
            application_use: Vec::new(),
        });

        target.seek(SeekFrom::Start(16 * SECTOR_SIZE as u64))?;
        let mut vd_buf = [0u8; SECTOR_SIZE];
        VolumeDescriptor::Primary(pvd).write(&mut vd_buf)?;
        image[16 * SECTOR_SIZE..17 * SECTOR_SIZE].copy_from_slice(&vd_buf);

        let mut next_vd_block = 17;
        if let Some(joliet_extents) = &joliet_dir_extents {
            let root_record_joliet = root_directory_record(joliet_extents);
            let joliet_path_table_size = joliet_path_entries
                .as_ref()
                .map(|entries| entries.iter().map(|e| path_table_entry_len(e)).sum::<usize>())
                .unwrap_or(0) as u32;
            let svd = SupplementaryVolumeDescriptor {
                volume_flags: 0,
                escape_sequences: JolietLevel::Level3.escape_sequence().to_vec(),
                joliet_level: Some(JolietLevel::Level3),
                body: VolumeDescriptorBody {
                    system_identifier: self.metadata.system_identifier.clone(),
                    volume_identifier: self.metadata.volume_identifier.clone(),
                    volume_space_size: total_sectors,
                    volume_set_size: 1,
                    volume_sequence_number: 1,
                    logical_block_size: SECTOR_SIZE as u16,
                    path_table_size: joliet_path_table_size,
                    type_l_path_table: joliet_path_table_l.unwrap().location,
                    optional_type_l_path_table: 0,
                    type_m_path_table: joliet_path_table_m.unwrap().location,
                    optional_type_m_path_table: 0,
                    root_directory_record: root_record_joliet,
                    volume_set_identifier: self.metadata.volume_set_identifier.clone(),
                    publisher_identifier: self.metadata.publisher_identifier.clone(),
                    data_preparer_identifier: self.metadata.data_preparer_identifier.clone(),
                    application_identifier: self.metadata.application_identifier.clone(),
                    copyright_file_identifier: String::new(),
                    abstract_file_identifier: String::new(),
                    bibliographic_file_identifier: String::new(),
                    creation_date_time: VolumeTimestamp::UNSPECIFIED,
                    modification_date_time: VolumeTimestamp::UNSPECIFIED,
                    expiration_date_time: VolumeTimestamp::UNSPECIFIED,
                    effective_date_time: VolumeTimestamp::UNSPECIFIED,
                    file_structure_version: 1,
                    application_use: Vec::new(),
                },
            };
            let mut buf = [0u8; SECTOR_SIZE];
            VolumeDescriptor::Supplementary(svd).write(&mut buf)?;
            let offset = next_vd_block * SECTOR_SIZE;
            image[offset..offset + SECTOR_SIZE].copy_from_slice(&buf);
            next_vd_block += 1;
        }

        if self.extensions.contains(Extensions::EL_TORITO) {
            if let Some(boot) = self.boot.clone() {
                let boot_file_extent = file_extents
                    .get(&boot.boot_file_path)
                    .copied()
                    .ok_or_else(|| Error::argument("configured boot file is not present in the tree"))?;

                if boot.patch_boot_info_table {
                    let bytes = self.read_file(&boot.boot_file_path)?;
                    let mut patched = bytes.clone();
                    let table = BootInfoTable {
                        primary_volume_descriptor_extent: 16,
                        boot_file_extent: boot_file_extent.location,
                        boot_file_length: bytes.len() as u32,
                        checksum: BootInfoTable::checksum_of(&patched),
                    };
                    table.patch(&mut patched)?;
                    let offset = boot_file_extent.location as usize * SECTOR_SIZE;
                    image[offset..offset + patched.len()].copy_from_slice(&patched);
                }

                let catalog_extent = boot_catalog_extent
                    .expect("boot_catalog_extent is reserved whenever self.boot is Some");
                let catalog = BootCatalog {
                    validation: crate::eltorito::ValidationEntry {
                        platform_id: boot.platform_id,
                        id_string: [0u8; 24],
                    },
                    default: crate::eltorito::BootEntry {
                        bootable: true,
                        emulation: boot.emulation,
                        load_segment: 0,
                        system_type: 0,
                        sector_count: 4,
                        load_rba: boot_file_extent.location,
                    },
                    sections: Vec::new(),
                };
                let catalog_bytes = catalog.write();
                let offset = catalog_extent.location as usize * SECTOR_SIZE;
                image[offset..offset + catalog_bytes.len()].copy_from_slice(&catalog_bytes);

                let mut boot_id = [0u8; 32];
                boot_id[..BOOT_RECORD_IDENTIFIER.len().min(32)]
                    .copy_from_slice(&BOOT_RECORD_IDENTIFIER[..BOOT_RECORD_IDENTIFIER.len().min(32)]);
                let boot_record = BootRecordDescriptor {
                    boot_system_identifier: boot_id,
                    boot_identifier: [0u8; 32],
                    boot_system_use: {
                        let mut use_field = vec![0u8; 2048 - 71];
                        use_field[0..4].copy_from_slice(&catalog_extent.location.to_le_bytes());
                        use_field
                    },
                };
                let mut buf = [0u8; SECTOR_SIZE];
                VolumeDescriptor::BootRecord(boot_record).write(&mut buf)?;
                let offset = next_vd_block * SECTOR_SIZE;
                image[offset..offset + SECTOR_SIZE].copy_from_slice(&buf);
                next_vd_block += 1;
            }
        }

        let mut term_buf = [0u8; SECTOR_SIZE];
        VolumeDescriptor::Terminator.write(&mut term_buf)?;
        let offset = next_vd_block * SECTOR_SIZE;
        image[offset..offset + SECTOR_SIZE].copy_from_slice(&term_buf);

        target.seek(SeekFrom::Start(0))?;
        let mut written = 0u64;
        for sector in image.chunks(SECTOR_SIZE) {
            target.write_all(sector)?;
            written += sector.len() as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(written, total_bytes);
            }
        }
        debug!("wrote image: {total_sectors} sectors ({total_bytes} bytes)");
        Ok(())
    }
}

fn path_table_entry_len(entry: &PathTableEntry) -> usize {
    let id_len = entry.identifier.len().max(1);
    8 + id_len + (id_len % 2)
}

fn root_directory_record(dir_extents: &BTreeMap<String, Extent>) -> DirectoryRecord {
    let root_extent = dir_extents[""];
    DirectoryRecord {
        extended_attribute_length: 0,
        extent_location: root_extent.location,
        data_length: root_extent.length_bytes(),
        recording_time: codec::RecordTimestamp::now(),
        flags: FileFlags::DIRECTORY,
        file_unit_size: 0,
        interleave_gap_size: 0,
        volume_sequence_number: 1,
        identifier: Identifier::SelfEntry,
        system_use: Vec::new(),
    }
}

fn build_path_table_entries(root: &TreeEntry, dir_extents: &BTreeMap<String, Extent>) -> Vec<PathTableEntry> {
    // Breadth-first so a directory's parent always has a lower path table
    // index than the directory itself, per ECMA-119 9.4.
    let mut entries = vec![PathTableEntry {
        extended_attribute_length: 0,
        extent_location: dir_extents[""].location,
        parent_directory_number: 1,
        identifier: vec![0],
    }];
    let mut index_of = BTreeMap::new();
    index_of.insert(String::new(), 1u16);

    let mut queue = std::collections::VecDeque::new();
    queue.push_back((String::new(), root));
    while let Some((path, node)) = queue.pop_front() {
        let parent_index = index_of[&path];
        if let Some(children) = node.children() {
            for (name, child) in children {
                if child.is_directory() {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}/{name}")
                    };
                    entries.push(PathTableEntry {
                        extended_attribute_length: 0,
                        extent_location: dir_extents[&child_path].location,
                        parent_directory_number: parent_index,
                        identifier: name.clone().into_bytes(),
                    });
                    index_of.insert(child_path.clone(), entries.len() as u16);
                    queue.push_back((child_path, child));
                }
            }
        }
    }
    entries
}

fn write_path_table_into(
    entries: &[PathTableEntry],
    endian: path_table::Endianness,
    extent: Extent,
    image: &mut [u8],
) {
    let bytes = path_table::write_path_table(entries, endian);
    let offset = extent.location as usize * SECTOR_SIZE;
    image[offset..offset + bytes.len()].copy_from_slice(&bytes);
}

fn write_tree_flat(
    node: &TreeEntry,
    path: &str,
    parent_path: &str,
    scheme: &dyn NameScheme,
    dir_extents: &BTreeMap<String, Extent>,
    file_extents: &BTreeMap<String, Extent>,
    image: &mut [u8],
) -> Result<()> {
    let extent = dir_extents[path];
    let offset = extent.location as usize * SECTOR_SIZE;
    let len = extent.length_bytes() as usize;
    serialize_dir_flat(
        node,
        path,
        parent_path,
        scheme,
        dir_extents,
        file_extents,
        &mut image[offset..offset + len],
    )?;
    if let Some(children) = node.children() {
        for (name, child) in children {
            if child.is_directory() {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                write_tree_flat(child, &child_path, path, scheme, dir_extents, file_extents, image)?;
            }
        }
    }
    Ok(())
}

/// Serialize just this directory's own records (not its children's) into
/// `target`, which is exactly this directory's extent.
fn serialize_dir_flat(
    node: &TreeEntry,
    path: &str,
    parent_path: &str,
    scheme: &dyn NameScheme,
    dir_extents: &BTreeMap<String, Extent>,
    file_extents: &BTreeMap<String, Extent>,
    target: &mut [u8],
) -> Result<()> {
    let own_extent = dir_extents[path];
    let parent_extent = dir_extents[parent_path];
    let children = node.children().expect("serialize_dir_flat called on a non-directory");

    let mut records = vec![
        DirectoryRecord {
            extended_attribute_length: 0,
            extent_location: own_extent.location,
            data_length: own_extent.length_bytes(),
            recording_time: node.recording_time,
            flags: FileFlags::DIRECTORY,
            file_unit_size: 0,
            interleave_gap_size: 0,
            volume_sequence_number: 1,
            identifier: Identifier::SelfEntry,
            system_use: Vec::new(),
        },
        DirectoryRecord {
            extended_attribute_length: 0,
            extent_location: parent_extent.location,
            data_length: parent_extent.length_bytes(),
            recording_time: node.recording_time,
            flags: FileFlags::DIRECTORY,
            file_unit_size: 0,
            interleave_gap_size: 0,
            volume_sequence_number: 1,
            identifier: Identifier::ParentEntry,
            system_use: Vec::new(),
        },
    ];

    for (name, child) in children {
        let is_dir = child.is_directory();
        let child_path = if path.is_empty() {
            name.clone()
        } else {
            format!("{path}/{name}")
        };
        let mut flags = FileFlags::empty();
        if is_dir {
            flags |= FileFlags::DIRECTORY;
        }
        if child.hidden {
            flags |= FileFlags::HIDDEN;
        }

        if is_dir {
            let e = dir_extents[&child_path];
            records.push(DirectoryRecord {
                extended_attribute_length: 0,
                extent_location: e.location,
                data_length: e.length_bytes(),
                recording_time: child.recording_time,
                flags,
                file_unit_size: 0,
                interleave_gap_size: 0,
                volume_sequence_number: 1,
                identifier: Identifier::Named(scheme.encode_name(name, true)),
                system_use: scheme.system_use(child, name),
            });
        } else if matches!(child.content, Content::File(_)) {
            let e = file_extents[&child_path];
            let identifier = Identifier::Named(scheme.encode_name(name, false));
            let system_use = scheme.system_use(child, name);
            // A chunk past the first carries no system use of its own; the
            // reader only resolves Rock Ridge attributes off the chain's
            // first record.
            for (i, (extent_location, chunk_len, is_multi_extent)) in
                file_record_chunks(e, data_length(child)).into_iter().enumerate()
            {
                let mut chunk_flags = flags;
                if is_multi_extent {
                    chunk_flags |= FileFlags::MULTI_EXTENT;
                }
                records.push(DirectoryRecord {
                    extended_attribute_length: 0,
                    extent_location,
                    data_length: chunk_len,
                    recording_time: child.recording_time,
                    flags: chunk_flags,
                    file_unit_size: 0,
                    interleave_gap_size: 0,
                    volume_sequence_number: 1,
                    identifier: identifier.clone(),
                    system_use: if i == 0 { system_use.clone() } else { Vec::new() },
                });
            }
        }
    }

    let mut offset = 0usize;
    let mut sector_base = 0usize;
    for record in &records {
        let len = record.serialized_len();
        if sector_base + len > SECTOR_SIZE {
            offset = (offset / SECTOR_SIZE + 1) * SECTOR_SIZE;
            sector_base = 0;
        }
        record.write(&mut target[offset..offset + len])?;
        offset += len;
        sector_base += len;
    }

    Ok(())
}

fn write_file_data(
    iso: &mut Iso<impl Read + Seek>,
    node: &TreeEntry,
    path: &str,
    file_extents: &BTreeMap<String, Extent>,
    image: &mut [u8],
) -> Result<()> {
    if let Some(children) = node.children() {
        for (name, child) in children {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            match &child.content {
                Content::File(_) => {
                    let bytes = iso.read_file(&child_path)?;
                    let extent = file_extents[&child_path];
                    let offset = extent.location as usize * SECTOR_SIZE;
                    image[offset..offset + bytes.len()].copy_from_slice(&bytes);
                }
                Content::Directory(_) => write_file_data(iso, child, &child_path, file_extents, image)?,
                Content::Symlink(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_open_empty_image_roundtrips() {
        let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(Extensions::empty());
        let mut buf = Cursor::new(Vec::new());
        iso.write(&mut buf, None).unwrap();

        let bytes = buf.into_inner();
        let cursor = Cursor::new(bytes);
        let opened = Iso::open(cursor, Extensions::empty()).unwrap();
        assert_eq!(opened.list_dir("").unwrap().len(), 0);
    }

    #[test]
    fn write_then_open_one_file_roundtrips() {
        let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(Extensions::empty());
        iso.add_file("hello.txt", b"hi there".to_vec()).unwrap();
        let mut buf = Cursor::new(Vec::new());
        iso.write(&mut buf, None).unwrap();

        let cursor = Cursor::new(buf.into_inner());
        let mut opened = Iso::open(cursor, Extensions::empty()).unwrap();
        let contents = opened.read_file("HELLO.TXT;1").unwrap();
        assert_eq!(contents, b"hi there");
    }

    #[test]
    fn operations_on_closed_session_are_rejected() {
        let iso: Iso<Cursor<Vec<u8>>> = Iso::create(Extensions::empty());
        let closed = iso;
        let err = closed.close();
        assert!(err.is_ok());
    }

    #[test]
    fn joliet_and_rock_ridge_roundtrip_through_a_real_file() {
        let extensions = Extensions::JOLIET | Extensions::ROCK_RIDGE;
        let mut iso: Iso<std::fs::File> = Iso::create(extensions);
        iso.add_directory("docs").unwrap();
        iso.add_file(
            "docs/a rather long report.txt",
            b"quarterly findings".to_vec(),
        )
        .unwrap();

        let mut file = tempfile::tempfile().unwrap();
        let mut calls = 0u32;
        iso.write(&mut file, Some(&mut |_, _| calls += 1)).unwrap();
        assert!(calls > 0);

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut opened = Iso::open(file, extensions).unwrap();
        assert_eq!(opened.list_dir("").unwrap(), vec!["docs".to_string()]);
        let contents = opened.read_file("docs/a rather long report.txt").unwrap();
        assert_eq!(contents, b"quarterly findings");
    }
}
