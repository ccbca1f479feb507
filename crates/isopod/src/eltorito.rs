//! El Torito bootable-CD support: the boot catalog (validation entry,
//! default entry, and optional section header/entry pairs) and the Boot
//! Info Table patch written into the boot image itself.

use crate::codec;
use crate::error::Error;
use crate::Result;

pub const BOOT_RECORD_IDENTIFIER: &[u8; 23] = b"EL TORITO SPECIFICATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformId {
    X86,
    PowerPc,
    Mac,
    Efi,
    Other(u8),
}

impl PlatformId {
    fn from_byte(b: u8) -> Self {
        match b {
            0x00 => PlatformId::X86,
            0x01 => PlatformId::PowerPc,
            0x02 => PlatformId::Mac,
            0xef => PlatformId::Efi,
            other => PlatformId::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            PlatformId::X86 => 0x00,
            PlatformId::PowerPc => 0x01,
            PlatformId::Mac => 0x02,
            PlatformId::Efi => 0xef,
            PlatformId::Other(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emulation {
    NoEmulation,
    Floppy1200K,
    Floppy1440K,
    Floppy2880K,
    HardDisk,
}

impl Emulation {
    fn from_nibble(b: u8) -> Result<Self> {
        match b & 0x0f {
            0x00 => Ok(Emulation::NoEmulation),
            0x01 => Ok(Emulation::Floppy1200K),
            0x02 => Ok(Emulation::Floppy1440K),
            0x03 => Ok(Emulation::Floppy2880K),
            0x04 => Ok(Emulation::HardDisk),
            other => Err(Error::format(
                "boot_catalog.entry.media_type",
                format!("unrecognized emulation type {other:#x}"),
            )),
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            Emulation::NoEmulation => 0x00,
            Emulation::Floppy1200K => 0x01,
            Emulation::Floppy1440K => 0x02,
            Emulation::Floppy2880K => 0x03,
            Emulation::HardDisk => 0x04,
        }
    }
}

/// The 32-byte validation entry that must begin a boot catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationEntry {
    pub platform_id: PlatformId,
    pub id_string: [u8; 24],
}

impl ValidationEntry {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::format("boot_catalog.validation_entry", "too short"));
        }
        if buf[0] != 0x01 {
            return Err(Error::format(
                "boot_catalog.validation_entry.header_id",
                "expected header ID 0x01",
            ));
        }
        let platform_id = PlatformId::from_byte(buf[1]);
        let mut id_string = [0u8; 24];
        id_string.copy_from_slice(&buf[4..28]);
        if u16::from_le_bytes([buf[30], buf[31]]) != 0xaa55 {
            return Err(Error::format(
                "boot_catalog.validation_entry.signature",
                "missing 0x55AA signature",
            ));
        }
        if checksum_words(&buf[0..32]) != 0 {
            return Err(Error::format(
                "boot_catalog.validation_entry.checksum",
                "validation entry checksum does not sum to zero",
            ));
        }
        Ok(Self { platform_id, id_string })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..32].fill(0);
        buf[0] = 0x01;
        buf[1] = self.platform_id.to_byte();
        buf[4..28].copy_from_slice(&self.id_string);
        buf[30..32].copy_from_slice(&0xaa55u16.to_le_bytes());
        let checksum = (0u16).wrapping_sub(checksum_words_excluding_field(&buf[0..32], 28));
        buf[28..30].copy_from_slice(&checksum.to_le_bytes());
    }
}

/// Sum every 16-bit little-endian word in `buf` (including the checksum
/// field itself, so a correctly-written entry sums to zero).
fn checksum_words(buf: &[u8]) -> u16 {
    buf.chunks_exact(2)
        .fold(0u16, |acc, pair| acc.wrapping_add(u16::from_le_bytes([pair[0], pair[1]])))
}

/// Sum every word except the 2-byte checksum field at `skip_offset`.
fn checksum_words_excluding_field(buf: &[u8], skip_offset: usize) -> u16 {
    buf.chunks_exact(2)
        .enumerate()
        .filter(|(i, _)| i * 2 != skip_offset)
        .fold(0u16, |acc, (_, pair)| acc.wrapping_add(u16::from_le_bytes([pair[0], pair[1]])))
}

/// A default or section boot entry (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootEntry {
    pub bootable: bool,
    pub emulation: Emulation,
    pub load_segment: u16,
    pub system_type: u8,
    pub sector_count: u16,
    pub load_rba: u32,
}

impl BootEntry {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::format("boot_catalog.entry", "too short"));
        }
        let bootable = match buf[0] {
            0x88 => true,
            0x00 => false,
            other => {
                return Err(Error::format(
                    "boot_catalog.entry.bootable",
                    format!("unrecognized bootable indicator {other:#x}"),
                ))
            }
        };
        let emulation = Emulation::from_nibble(buf[1])?;
        let load_segment = u16::from_le_bytes([buf[2], buf[3]]);
        let system_type = buf[4];
        let sector_count = u16::from_le_bytes([buf[6], buf[7]]);
        let load_rba = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Ok(Self {
            bootable,
            emulation,
            load_segment,
            system_type,
            sector_count,
            load_rba,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..32].fill(0);
        buf[0] = if self.bootable { 0x88 } else { 0x00 };
        buf[1] = self.emulation.to_nibble();
        buf[2..4].copy_from_slice(&self.load_segment.to_le_bytes());
        buf[4] = self.system_type;
        buf[6..8].copy_from_slice(&self.sector_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.load_rba.to_le_bytes());
    }
}

/// A section header preceding a run of section entries, for multi-platform
/// or multi-image boot catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub is_last: bool,
    pub platform_id: PlatformId,
    pub entry_count: u16,
}

impl SectionHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::format("boot_catalog.section_header", "too short"));
        }
        let is_last = match buf[0] {
            0x91 => true,
            0x90 => false,
            other => {
                return Err(Error::format(
                    "boot_catalog.section_header.indicator",
                    format!("unrecognized section header indicator {other:#x}"),
                ))
            }
        };
        let platform_id = PlatformId::from_byte(buf[1]);
        let entry_count = u16::from_le_bytes([buf[2], buf[3]]);
        Ok(Self {
            is_last,
            platform_id,
            entry_count,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..32].fill(0);
        buf[0] = if self.is_last { 0x91 } else { 0x90 };
        buf[1] = self.platform_id.to_byte();
        buf[2..4].copy_from_slice(&self.entry_count.to_le_bytes());
    }
}

/// A fully-parsed boot catalog: the mandatory validation and default
/// entries, plus any section header/entries pairs that follow.
#[derive(Debug, Clone)]
pub struct BootCatalog {
    pub validation: ValidationEntry,
    pub default: BootEntry,
    pub sections: Vec<(SectionHeader, Vec<BootEntry>)>,
}

impl BootCatalog {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(Error::format("boot_catalog", "too short for validation and default entries"));
        }
        let validation = ValidationEntry::parse(&buf[0..32])?;
        let default = BootEntry::parse(&buf[32..64])?;
        let mut sections = Vec::new();
        let mut offset = 64;
        while offset + 32 <= buf.len() {
            match buf[offset] {
                0x90 | 0x91 => {
                    let header = SectionHeader::parse(&buf[offset..offset + 32])?;
                    offset += 32;
                    let mut entries = Vec::new();
                    for _ in 0..header.entry_count {
                        if offset + 32 > buf.len() {
                            return Err(Error::format("boot_catalog.section", "truncated section entries"));
                        }
                        entries.push(BootEntry::parse(&buf[offset..offset + 32])?);
                        offset += 32;
                    }
                    let is_last = header.is_last;
                    sections.push((header, entries));
                    if is_last {
                        break;
                    }
                }
                0x00 => break,
                other => {
                    return Err(Error::format(
                        "boot_catalog",
                        format!("unrecognized catalog entry indicator {other:#x}"),
                    ))
                }
            }
        }
        Ok(Self {
            validation,
            default,
            sections,
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 32 + 32 + self.sections.iter().map(|(_, e)| 32 + 32 * e.len()).sum::<usize>()];
        self.validation.write(&mut buf[0..32]);
        self.default.write(&mut buf[32..64]);
        let mut offset = 64;
        for (header, entries) in &self.sections {
            header.write(&mut buf[offset..offset + 32]);
            offset += 32;
            for entry in entries {
                entry.write(&mut buf[offset..offset + 32]);
                offset += 32;
            }
        }
        buf
    }
}

/// The 56-byte Boot Info Table patched into the boot image at offset 8,
/// once the image's own extent is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfoTable {
    pub primary_volume_descriptor_extent: u32,
    pub boot_file_extent: u32,
    pub boot_file_length: u32,
    pub checksum: u32,
}

impl BootInfoTable {
    pub const OFFSET: usize = 8;
    pub const LEN: usize = 56;

    /// Compute the checksum as the sum of every 32-bit little-endian word
    /// of the boot file starting at byte 64 (past the Boot Info Table
    /// itself), per the El Torito specification.
    pub fn checksum_of(boot_file: &[u8]) -> u32 {
        boot_file[64..]
            .chunks_exact(4)
            .fold(0u32, |acc, w| acc.wrapping_add(u32::from_le_bytes(w.try_into().unwrap())))
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::format("boot_info_table", "too short"));
        }
        Ok(Self {
            primary_volume_descriptor_extent: codec::le_u32(&buf[0..4]),
            boot_file_extent: codec::le_u32(&buf[4..8]),
            boot_file_length: codec::le_u32(&buf[8..12]),
            checksum: codec::le_u32(&buf[12..16]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..Self::LEN].fill(0);
        buf[0..4].copy_from_slice(&self.primary_volume_descriptor_extent.to_le_bytes());
        buf[4..8].copy_from_slice(&self.boot_file_extent.to_le_bytes());
        buf[8..12].copy_from_slice(&self.boot_file_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Patch a boot image's bytes in place with this table at its fixed
    /// offset 8, leaving the rest of the file untouched.
    pub fn patch(&self, boot_file: &mut [u8]) -> Result<()> {
        if boot_file.len() < Self::OFFSET + Self::LEN {
            return Err(Error::format("boot_info_table", "boot file too short to hold the patch"));
        }
        self.write(&mut boot_file[Self::OFFSET..Self::OFFSET + Self::LEN]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_entry_roundtrips_and_checksums_to_zero() {
        let entry = ValidationEntry {
            platform_id: PlatformId::X86,
            id_string: [0u8; 24],
        };
        let mut buf = [0u8; 32];
        entry.write(&mut buf);
        let parsed = ValidationEntry::parse(&buf).unwrap();
        assert_eq!(parsed.platform_id, PlatformId::X86);
        assert_eq!(checksum_words(&buf), 0);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let entry = ValidationEntry {
            platform_id: PlatformId::X86,
            id_string: [0u8; 24],
        };
        let mut buf = [0u8; 32];
        entry.write(&mut buf);
        buf[4] ^= 0xff;
        assert!(ValidationEntry::parse(&buf).is_err());
    }

    #[test]
    fn boot_entry_roundtrips() {
        let entry = BootEntry {
            bootable: true,
            emulation: Emulation::NoEmulation,
            load_segment: 0,
            system_type: 0,
            sector_count: 4,
            load_rba: 30,
        };
        let mut buf = [0u8; 32];
        entry.write(&mut buf);
        let parsed = BootEntry::parse(&buf).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn boot_catalog_with_one_section_roundtrips() {
        let validation = ValidationEntry {
            platform_id: PlatformId::Efi,
            id_string: [0u8; 24],
        };
        let default = BootEntry {
            bootable: true,
            emulation: Emulation::NoEmulation,
            load_segment: 0,
            system_type: 0,
            sector_count: 4,
            load_rba: 30,
        };
        let section_entry = BootEntry {
            bootable: true,
            emulation: Emulation::HardDisk,
            load_segment: 0,
            system_type: 0,
            sector_count: 1,
            load_rba: 40,
        };
        let catalog = BootCatalog {
            validation,
            default,
            sections: vec![(
                SectionHeader {
                    is_last: true,
                    platform_id: PlatformId::Efi,
                    entry_count: 1,
                },
                vec![section_entry],
            )],
        };
        let bytes = catalog.write();
        let parsed = BootCatalog::parse(&bytes).unwrap();
        assert_eq!(parsed.sections.len(), 1);
        assert_eq!(parsed.sections[0].1[0], section_entry);
    }

    #[test]
    fn boot_info_table_patches_fixed_offset() {
        let table = BootInfoTable {
            primary_volume_descriptor_extent: 16,
            boot_file_extent: 30,
            boot_file_length: 4096,
            checksum: 0x1234,
        };
        let mut image = vec![0u8; 4096];
        table.patch(&mut image).unwrap();
        let parsed = BootInfoTable::parse(&image[BootInfoTable::OFFSET..]).unwrap();
        assert_eq!(parsed, table);
    }
}
