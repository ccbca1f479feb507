//! Path tables (ECMA-119 §9.4): a flat, breadth-first index of every
//! directory's extent and parent, stored twice — once little-endian (the
//! "L" table) and once big-endian (the "M" table) — so a reader never has
//! to walk the directory tree just to resolve a path.

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTableEntry {
    pub extended_attribute_length: u8,
    pub extent_location: u32,
    /// 1-based index of this entry's parent within the same path table.
    pub parent_directory_number: u16,
    pub identifier: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl PathTableEntry {
    fn serialized_len(&self) -> usize {
        let id_len = self.identifier.len().max(1);
        8 + id_len + (id_len % 2)
    }

    fn parse(field: &'static str, buf: &[u8], endian: Endianness) -> Result<Option<(Self, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let id_len = buf[0] as usize;
        if id_len == 0 || buf.len() < 8 + id_len {
            return Ok(None);
        }
        let extended_attribute_length = buf[1];
        let extent_location = match endian {
            Endianness::Little => u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            Endianness::Big => u32::from_be_bytes(buf[2..6].try_into().unwrap()),
        };
        let parent_directory_number = match endian {
            Endianness::Little => u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            Endianness::Big => u16::from_be_bytes(buf[6..8].try_into().unwrap()),
        };
        if parent_directory_number == 0 {
            return Err(Error::format(field, "path table parent directory number is zero"));
        }
        let identifier = buf[8..8 + id_len].to_vec();
        let mut consumed = 8 + id_len;
        if id_len % 2 != 0 {
            consumed += 1;
        }
        Ok(Some((
            Self {
                extended_attribute_length,
                extent_location,
                parent_directory_number,
                identifier,
            },
            consumed,
        )))
    }

    fn write(&self, buf: &mut [u8], endian: Endianness) {
        let id_len = self.identifier.len().max(1);
        buf[0] = id_len as u8;
        buf[1] = self.extended_attribute_length;
        match endian {
            Endianness::Little => buf[2..6].copy_from_slice(&self.extent_location.to_le_bytes()),
            Endianness::Big => buf[2..6].copy_from_slice(&self.extent_location.to_be_bytes()),
        }
        match endian {
            Endianness::Little => buf[6..8].copy_from_slice(&self.parent_directory_number.to_le_bytes()),
            Endianness::Big => buf[6..8].copy_from_slice(&self.parent_directory_number.to_be_bytes()),
        }
        buf[8..8 + self.identifier.len()].copy_from_slice(&self.identifier);
    }
}

/// Parse every entry out of a path table's decoded extent bytes.
pub fn parse_path_table(
    field: &'static str,
    buf: &[u8],
    endian: Endianness,
) -> Result<Vec<PathTableEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match PathTableEntry::parse(field, &buf[offset..], endian)? {
            None => break,
            Some((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
        }
    }
    Ok(entries)
}

/// Serialize a full path table (both the L and M forms use this, with the
/// opposite `Endianness`), padded to a whole number of 2048-byte extents
/// with zero bytes.
pub fn write_path_table(entries: &[PathTableEntry], endian: Endianness) -> Vec<u8> {
    let total: usize = entries.iter().map(|e| e.serialized_len()).sum();
    let mut buf = vec![0u8; total];
    let mut offset = 0;
    for entry in entries {
        let len = entry.serialized_len();
        entry.write(&mut buf[offset..offset + len], endian);
        offset += len;
    }
    buf
}

/// Compare the L and M path tables for exact content agreement (same
/// entries, same order), independent of their differing byte encodings.
pub fn tables_agree(l: &[PathTableEntry], m: &[PathTableEntry]) -> bool {
    l == m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &[u8], parent: u16, extent: u32) -> PathTableEntry {
        PathTableEntry {
            extended_attribute_length: 0,
            extent_location: extent,
            parent_directory_number: parent,
            identifier: id.to_vec(),
        }
    }

    #[test]
    fn roundtrip_little_and_big_endian() {
        let entries = vec![entry(&[0], 1, 20), entry(b"DOCS", 1, 21)];
        for endian in [Endianness::Little, Endianness::Big] {
            let bytes = write_path_table(&entries, endian);
            let parsed = parse_path_table("test", &bytes, endian).unwrap();
            assert_eq!(parsed, entries);
        }
    }

    #[test]
    fn zero_parent_is_format_error() {
        let mut buf = vec![0u8; 9];
        buf[0] = 1;
        buf[6] = 0;
        buf[7] = 0;
        let err = PathTableEntry::parse("test", &buf, Endianness::Little).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn odd_length_identifier_is_padded() {
        let entries = vec![entry(b"ABC", 1, 22)];
        let bytes = write_path_table(&entries, Endianness::Little);
        assert_eq!(bytes.len() % 2, 0);
    }
}
