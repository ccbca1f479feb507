//! Directory record encode/decode (ECMA-119 §9.1).
//!
//! A directory's extent is a sequence of variable-length records; a record
//! never straddles a 2048-byte logical block, and a zero length byte means
//! "advance to the next block". This module only deals with the fixed
//! record shape and the raw, not-yet-continuation-resolved system use
//! bytes; CE-chain resolution lives in [`crate::rockridge`].

use crate::codec;
use crate::error::Error;
use crate::Result;

pub const SECTOR_SIZE: usize = 2048;

bitflags::bitflags! {
    /// ECMA-119 §9.1.6 file flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u8 {
        const HIDDEN = 1 << 0;
        const DIRECTORY = 1 << 1;
        const ASSOCIATED_FILE = 1 << 2;
        const RECORD = 1 << 3;
        const PROTECTION = 1 << 4;
        const MULTI_EXTENT = 1 << 7;
    }
}

/// The file identifier as stored on disk: the two special single-byte
/// forms, or an arbitrary name (which may carry a ";version" suffix on
/// ISO-only images).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    SelfEntry,
    ParentEntry,
    Named(Vec<u8>),
}

impl Identifier {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            [0] => Identifier::SelfEntry,
            [1] => Identifier::ParentEntry,
            other => Identifier::Named(other.to_vec()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Identifier::SelfEntry => vec![0],
            Identifier::ParentEntry => vec![1],
            Identifier::Named(bytes) => bytes.clone(),
        }
    }

    /// The name with any ";version" suffix stripped, decoded lossily as
    /// Latin-1/ASCII (ISO 9660 d-characters are a subset of ASCII).
    pub fn name_without_version(&self) -> String {
        match self {
            Identifier::SelfEntry => ".".to_string(),
            Identifier::ParentEntry => "..".to_string(),
            Identifier::Named(bytes) => {
                let s = String::from_utf8_lossy(bytes);
                match s.rsplit_once(';') {
                    Some((name, version)) if version.chars().all(|c| c.is_ascii_digit()) => {
                        name.to_string()
                    }
                    _ => s.into_owned(),
                }
            }
        }
    }

    pub fn version(&self) -> Option<u16> {
        match self {
            Identifier::Named(bytes) => {
                let s = String::from_utf8_lossy(bytes);
                s.rsplit_once(';').and_then(|(_, v)| v.parse().ok())
            }
            _ => None,
        }
    }
}

/// A single directory record as read from (or to be written to) an
/// extent, before Rock Ridge CE resolution.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub extended_attribute_length: u8,
    pub extent_location: u32,
    pub data_length: u32,
    pub recording_time: codec::RecordTimestamp,
    pub flags: FileFlags,
    pub file_unit_size: u8,
    pub interleave_gap_size: u8,
    pub volume_sequence_number: u16,
    pub identifier: Identifier,
    /// Raw bytes of the system use area trailing the (padded) identifier,
    /// not yet resolved across CE continuations.
    pub system_use: Vec<u8>,
}

impl DirectoryRecord {
    /// Length of the fixed-size header, the length byte included.
    const FIXED_LEN: usize = 33;

    pub fn is_directory(&self) -> bool {
        self.flags.contains(FileFlags::DIRECTORY)
    }

    /// Total length this record will occupy on disk, including identifier
    /// padding and system use, but excluding padding inserted by the
    /// caller to reach a block boundary.
    pub fn serialized_len(&self) -> usize {
        let id_len = self.identifier.to_bytes().len();
        let mut len = Self::FIXED_LEN + id_len;
        if id_len % 2 == 0 {
            len += 1; // padding byte to keep the record even-length
        }
        len += self.system_use.len();
        len
    }

    /// Parse one record starting at `buf[0]`. Returns `None` if the length
    /// byte is zero (meaning: no more records in this logical block).
    /// Returns the record plus the number of bytes consumed.
    pub fn parse(field: &'static str, buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.is_empty() || buf[0] == 0 {
            return Ok(None);
        }
        let length = buf[0] as usize;
        if length < Self::FIXED_LEN || length > buf.len() {
            return Err(Error::format(field, "directory record length out of range"));
        }
        let extended_attribute_length = buf[1];
        let extent_location = codec::read_u32_lsb_msb(field, &buf[2..10])?;
        let data_length = codec::read_u32_lsb_msb(field, &buf[10..18])?;
        let recording_time = codec::RecordTimestamp::read(field, &buf[18..25])?;
        let flags = FileFlags::from_bits_truncate(buf[25]);
        let file_unit_size = buf[26];
        let interleave_gap_size = buf[27];
        let volume_sequence_number = codec::read_u16_lsb_msb(field, &buf[28..32])?;
        let id_len = buf[32] as usize;
        if Self::FIXED_LEN + id_len > length {
            return Err(Error::format(field, "file identifier overruns record"));
        }
        let identifier = Identifier::from_bytes(&buf[33..33 + id_len]);
        let mut offset = 33 + id_len;
        if id_len % 2 == 0 {
            offset += 1;
        }
        let system_use = if offset < length {
            buf[offset..length].to_vec()
        } else {
            Vec::new()
        };

        Ok(Some((
            Self {
                extended_attribute_length,
                extent_location,
                data_length,
                recording_time,
                flags,
                file_unit_size,
                interleave_gap_size,
                volume_sequence_number,
                identifier,
                system_use,
            },
            length,
        )))
    }

    /// Serialize into `buf`, which must be at least [`Self::serialized_len`]
    /// bytes and is not block-aligned by this call.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let len = self.serialized_len();
        if buf.len() < len {
            return Err(Error::format(
                "directory_record",
                "buffer too small for directory record",
            ));
        }
        buf[..len].fill(0);
        buf[0] = len as u8;
        buf[1] = self.extended_attribute_length;
        codec::write_u32_lsb_msb(&mut buf[2..10], self.extent_location);
        codec::write_u32_lsb_msb(&mut buf[10..18], self.data_length);
        self.recording_time.write(&mut buf[18..25]);
        buf[25] = self.flags.bits();
        buf[26] = self.file_unit_size;
        buf[27] = self.interleave_gap_size;
        codec::write_u16_lsb_msb(&mut buf[28..32], self.volume_sequence_number);
        let id_bytes = self.identifier.to_bytes();
        buf[32] = id_bytes.len() as u8;
        buf[33..33 + id_bytes.len()].copy_from_slice(&id_bytes);
        let mut offset = 33 + id_bytes.len();
        if id_bytes.len() % 2 == 0 {
            offset += 1; // padding byte already zeroed above
        }
        buf[offset..offset + self.system_use.len()].copy_from_slice(&self.system_use);
        Ok(())
    }
}

/// Walk a directory's extent buffer and return every record in it,
/// respecting the "zero length byte advances to next block" rule and
/// rejecting any record that would straddle a block boundary.
pub fn read_directory_records(field: &'static str, buf: &[u8]) -> Result<Vec<DirectoryRecord>> {
    let mut records = Vec::new();
    let mut block_start = 0usize;
    while block_start < buf.len() {
        let block_end = (block_start + SECTOR_SIZE).min(buf.len());
        let mut offset = block_start;
        while offset < block_end {
            match DirectoryRecord::parse(field, &buf[offset..block_end])? {
                None => break,
                Some((record, consumed)) => {
                    if offset + consumed > block_end {
                        return Err(Error::format(
                            field,
                            "directory record straddles a logical block boundary",
                        ));
                    }
                    records.push(record);
                    offset += consumed;
                }
            }
        }
        block_start += SECTOR_SIZE;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: Identifier) -> DirectoryRecord {
        DirectoryRecord {
            extended_attribute_length: 0,
            extent_location: 24,
            data_length: 4,
            recording_time: codec::RecordTimestamp::now(),
            flags: FileFlags::empty(),
            file_unit_size: 0,
            interleave_gap_size: 0,
            volume_sequence_number: 1,
            identifier: id,
            system_use: Vec::new(),
        }
    }

    #[test]
    fn roundtrip_named_record() {
        let record = sample(Identifier::Named(b"FOO.;1".to_vec()));
        let mut buf = vec![0u8; record.serialized_len()];
        record.write(&mut buf).unwrap();
        let (parsed, consumed) = DirectoryRecord::parse("test", &buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed.extent_location, 24);
        assert_eq!(parsed.data_length, 4);
        assert_eq!(parsed.identifier, Identifier::Named(b"FOO.;1".to_vec()));
    }

    #[test]
    fn self_and_parent_identifiers() {
        assert_eq!(Identifier::from_bytes(&[0]), Identifier::SelfEntry);
        assert_eq!(Identifier::from_bytes(&[1]), Identifier::ParentEntry);
    }

    #[test]
    fn name_without_version_strips_suffix() {
        let id = Identifier::Named(b"FOO.TXT;1".to_vec());
        assert_eq!(id.name_without_version(), "FOO.TXT");
        assert_eq!(id.version(), Some(1));
    }

    #[test]
    fn zero_length_byte_ends_block() {
        let mut buf = vec![0u8; SECTOR_SIZE];
        let record = sample(Identifier::SelfEntry);
        let mut header = vec![0u8; record.serialized_len()];
        record.write(&mut header).unwrap();
        buf[..header.len()].copy_from_slice(&header);
        let records = read_directory_records("test", &buf).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn record_straddling_block_is_rejected() {
        // Claims 40 bytes but only 10 remain before the block boundary.
        let mut buf = vec![0u8; SECTOR_SIZE * 2];
        buf[SECTOR_SIZE - 10] = 40;
        buf[SECTOR_SIZE - 10 + 32] = 1;
        let err = read_directory_records("test", &buf).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }
}
