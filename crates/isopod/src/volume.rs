//! Volume descriptors (ECMA-119 §8): the Primary and Supplementary Volume
//! Descriptors, the Boot Record, and the Set Terminator that make up the
//! Volume Descriptor Set starting at logical block 16.

use crate::codec::{self, VolumeTimestamp};
use crate::directory::DirectoryRecord;
use crate::error::Error;
use crate::Result;

pub const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

const TYPE_BOOT_RECORD: u8 = 0;
const TYPE_PRIMARY: u8 = 1;
const TYPE_SUPPLEMENTARY: u8 = 2;
const TYPE_PARTITION: u8 = 3;
const TYPE_TERMINATOR: u8 = 255;

/// Joliet level, identified by the SVD's escape sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JolietLevel {
    Level1,
    Level2,
    Level3,
}

impl JolietLevel {
    pub fn from_escape_sequence(seq: &[u8]) -> Option<Self> {
        match seq {
            [b'%', b'/', b'@', ..] => Some(JolietLevel::Level1),
            [b'%', b'/', b'C', ..] => Some(JolietLevel::Level2),
            [b'%', b'/', b'E', ..] => Some(JolietLevel::Level3),
            _ => None,
        }
    }

    pub fn escape_sequence(self) -> &'static [u8; 3] {
        match self {
            JolietLevel::Level1 => b"%/@",
            JolietLevel::Level2 => b"%/C",
            JolietLevel::Level3 => b"%/E",
        }
    }
}

/// Fields shared by the Primary and a Joliet Supplementary Volume
/// Descriptor; SVD adds `volume_flags` and an `escape_sequences` field in
/// place of the PVD's first unused area.
#[derive(Debug, Clone)]
pub struct VolumeDescriptorBody {
    pub system_identifier: String,
    pub volume_identifier: String,
    pub volume_space_size: u32,
    pub volume_set_size: u16,
    pub volume_sequence_number: u16,
    pub logical_block_size: u16,
    pub path_table_size: u32,
    pub type_l_path_table: u32,
    pub optional_type_l_path_table: u32,
    pub type_m_path_table: u32,
    pub optional_type_m_path_table: u32,
    pub root_directory_record: DirectoryRecord,
    pub volume_set_identifier: String,
    pub publisher_identifier: String,
    pub data_preparer_identifier: String,
    pub application_identifier: String,
    pub copyright_file_identifier: String,
    pub abstract_file_identifier: String,
    pub bibliographic_file_identifier: String,
    pub creation_date_time: VolumeTimestamp,
    pub modification_date_time: VolumeTimestamp,
    pub expiration_date_time: VolumeTimestamp,
    pub effective_date_time: VolumeTimestamp,
    pub file_structure_version: u8,
    pub application_use: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PrimaryVolumeDescriptor(pub VolumeDescriptorBody);

#[derive(Debug, Clone)]
pub struct SupplementaryVolumeDescriptor {
    pub volume_flags: u8,
    pub escape_sequences: Vec<u8>,
    pub joliet_level: Option<JolietLevel>,
    pub body: VolumeDescriptorBody,
}

#[derive(Debug, Clone)]
pub struct BootRecordDescriptor {
    pub boot_system_identifier: [u8; 32],
    pub boot_identifier: [u8; 32],
    pub boot_system_use: Vec<u8>,
}

/// One entry of the Volume Descriptor Set.
#[derive(Debug, Clone)]
pub enum VolumeDescriptor {
    Primary(PrimaryVolumeDescriptor),
    Supplementary(SupplementaryVolumeDescriptor),
    BootRecord(BootRecordDescriptor),
    /// A Volume Partition Descriptor or any other type this library does
    /// not interpret, preserved byte-for-byte so a read/write round trip
    /// does not lose it.
    Opaque { type_code: u8, data: Box<[u8; 2041]> },
    Terminator,
}

fn read_body(buf: &[u8]) -> Result<VolumeDescriptorBody> {
    let system_identifier = codec::read_text_field(&buf[8..40]);
    let volume_identifier = codec::read_text_field(&buf[40..72]);
    codec::verify_zero("volume_descriptor.unused_72", &buf[72..80])?;
    let volume_space_size = codec::read_u32_lsb_msb("volume_descriptor.volume_space_size", &buf[80..88])?;
    let volume_set_size = codec::read_u16_lsb_msb("volume_descriptor.volume_set_size", &buf[120..124])?;
    let volume_sequence_number =
        codec::read_u16_lsb_msb("volume_descriptor.volume_sequence_number", &buf[124..128])?;
    let logical_block_size = codec::read_u16_lsb_msb("volume_descriptor.logical_block_size", &buf[128..132])?;
    let path_table_size = codec::read_u32_lsb_msb("volume_descriptor.path_table_size", &buf[132..140])?;
    let type_l_path_table = u32::from_le_bytes(buf[140..144].try_into().unwrap());
    let optional_type_l_path_table = u32::from_le_bytes(buf[144..148].try_into().unwrap());
    let type_m_path_table = u32::from_be_bytes(buf[148..152].try_into().unwrap());
    let optional_type_m_path_table = u32::from_be_bytes(buf[152..156].try_into().unwrap());
    let (root_directory_record, _) =
        DirectoryRecord::parse("volume_descriptor.root_directory_record", &buf[156..190])?
            .ok_or_else(|| {
                Error::format(
                    "volume_descriptor.root_directory_record",
                    "root directory record is empty",
                )
            })?;
    let volume_set_identifier = codec::read_text_field(&buf[190..318]);
    let publisher_identifier = codec::read_text_field(&buf[318..446]);
    let data_preparer_identifier = codec::read_text_field(&buf[446..574]);
    let application_identifier = codec::read_text_field(&buf[574..702]);
    let copyright_file_identifier = codec::read_text_field(&buf[702..739]);
    let abstract_file_identifier = codec::read_text_field(&buf[739..776]);
    let bibliographic_file_identifier = codec::read_text_field(&buf[776..813]);
    let creation_date_time = VolumeTimestamp::read("volume_descriptor.creation_date_time", &buf[813..830])?;
    let modification_date_time =
        VolumeTimestamp::read("volume_descriptor.modification_date_time", &buf[830..847])?;
    let expiration_date_time =
        VolumeTimestamp::read("volume_descriptor.expiration_date_time", &buf[847..864])?;
    let effective_date_time = VolumeTimestamp::read("volume_descriptor.effective_date_time", &buf[864..881])?;
    let file_structure_version = buf[881];
    codec::verify_zero("volume_descriptor.reserved_882", &buf[882..883])?;
    let application_use = buf[883..1395].to_vec();
    codec::verify_zero("volume_descriptor.reserved_1395", &buf[1395..2048])?;

    Ok(VolumeDescriptorBody {
        system_identifier,
        volume_identifier,
        volume_space_size,
        volume_set_size,
        volume_sequence_number,
        logical_block_size,
        path_table_size,
        type_l_path_table,
        optional_type_l_path_table,
        type_m_path_table,
        optional_type_m_path_table,
        root_directory_record,
        volume_set_identifier,
        publisher_identifier,
        data_preparer_identifier,
        application_identifier,
        copyright_file_identifier,
        abstract_file_identifier,
        bibliographic_file_identifier,
        creation_date_time,
        modification_date_time,
        expiration_date_time,
        effective_date_time,
        file_structure_version,
        application_use,
    })
}

fn write_body(body: &VolumeDescriptorBody, buf: &mut [u8]) -> Result<()> {
    codec::write_text_field(&mut buf[8..40], &body.system_identifier, codec::is_a_character);
    codec::write_text_field(&mut buf[40..72], &body.volume_identifier, codec::is_d_character);
    codec::write_u32_lsb_msb(&mut buf[80..88], body.volume_space_size);
    codec::write_u16_lsb_msb(&mut buf[120..124], body.volume_set_size);
    codec::write_u16_lsb_msb(&mut buf[124..128], body.volume_sequence_number);
    codec::write_u16_lsb_msb(&mut buf[128..132], body.logical_block_size);
    codec::write_u32_lsb_msb(&mut buf[132..140], body.path_table_size);
    buf[140..144].copy_from_slice(&body.type_l_path_table.to_le_bytes());
    buf[144..148].copy_from_slice(&body.optional_type_l_path_table.to_le_bytes());
    buf[148..152].copy_from_slice(&body.type_m_path_table.to_be_bytes());
    buf[152..156].copy_from_slice(&body.optional_type_m_path_table.to_be_bytes());
    body.root_directory_record.write(&mut buf[156..190])?;
    codec::write_text_field(&mut buf[190..318], &body.volume_set_identifier, codec::is_d_character);
    codec::write_text_field(&mut buf[318..446], &body.publisher_identifier, codec::is_a_character);
    codec::write_text_field(&mut buf[446..574], &body.data_preparer_identifier, codec::is_a_character);
    codec::write_text_field(&mut buf[574..702], &body.application_identifier, codec::is_a_character);
    codec::write_text_field(&mut buf[702..739], &body.copyright_file_identifier, codec::is_d_character);
    codec::write_text_field(&mut buf[739..776], &body.abstract_file_identifier, codec::is_d_character);
    codec::write_text_field(
        &mut buf[776..813],
        &body.bibliographic_file_identifier,
        codec::is_d_character,
    );
    body.creation_date_time.write(&mut buf[813..830]);
    body.modification_date_time.write(&mut buf[830..847]);
    body.expiration_date_time.write(&mut buf[847..864]);
    body.effective_date_time.write(&mut buf[864..881]);
    buf[881] = body.file_structure_version;
    let use_len = body.application_use.len().min(512);
    buf[883..883 + use_len].copy_from_slice(&body.application_use[..use_len]);
    Ok(())
}

fn read_header(buf: &[u8]) -> Result<u8> {
    if buf.len() < 2048 {
        return Err(Error::format("volume_descriptor", "block shorter than one logical block"));
    }
    let type_code = buf[0];
    if &buf[1..6] != STANDARD_IDENTIFIER {
        return Err(Error::format(
            "volume_descriptor.standard_identifier",
            "missing CD001 standard identifier",
        ));
    }
    // PVD/SVD/Boot Record are all version 1; this library does not read or
    // write ISO 9660:1999 Enhanced Volume Descriptors (SVD version 2).
    if buf[6] != 1 {
        return Err(Error::format(
            "volume_descriptor.version",
            "unsupported volume descriptor version",
        ));
    }
    Ok(type_code)
}

impl VolumeDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let type_code = read_header(buf)?;
        match type_code {
            TYPE_TERMINATOR => Ok(VolumeDescriptor::Terminator),
            TYPE_BOOT_RECORD => {
                let mut boot_system_identifier = [0u8; 32];
                boot_system_identifier.copy_from_slice(&buf[7..39]);
                let mut boot_identifier = [0u8; 32];
                boot_identifier.copy_from_slice(&buf[39..71]);
                let boot_system_use = buf[71..2048].to_vec();
                Ok(VolumeDescriptor::BootRecord(BootRecordDescriptor {
                    boot_system_identifier,
                    boot_identifier,
                    boot_system_use,
                }))
            }
            TYPE_PRIMARY => {
                codec::verify_zero("primary_volume_descriptor.unused_7", &buf[7..8])?;
                codec::verify_zero("primary_volume_descriptor.unused_88", &buf[88..120])?;
                let body = read_body(buf)?;
                Ok(VolumeDescriptor::Primary(PrimaryVolumeDescriptor(body)))
            }
            TYPE_SUPPLEMENTARY => {
                let volume_flags = buf[7];
                let escape_sequences = buf[88..120].to_vec();
                let joliet_level = JolietLevel::from_escape_sequence(&escape_sequences);
                // The escape sequence area overlaps the PVD's "unused"
                // field at offset 72..80, which is reused for Volume
                // Flags/Escape Sequences in the SVD layout, so read_body's
                // zero-check on 72..80 still applies unchanged.
                let body = read_body(buf)?;
                Ok(VolumeDescriptor::Supplementary(SupplementaryVolumeDescriptor {
                    volume_flags,
                    escape_sequences,
                    joliet_level,
                    body,
                }))
            }
            TYPE_PARTITION => {
                let mut data = Box::new([0u8; 2041]);
                data.copy_from_slice(&buf[7..2048]);
                Ok(VolumeDescriptor::Opaque { type_code, data })
            }
            other => {
                let mut data = Box::new([0u8; 2041]);
                data.copy_from_slice(&buf[7..2048]);
                Ok(VolumeDescriptor::Opaque { type_code: other, data })
            }
        }
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < 2048 {
            return Err(Error::format("volume_descriptor", "buffer shorter than one logical block"));
        }
        buf.fill(0);
        buf[1..6].copy_from_slice(STANDARD_IDENTIFIER);
        buf[6] = 1;
        match self {
            VolumeDescriptor::Terminator => {
                buf[0] = TYPE_TERMINATOR;
            }
            VolumeDescriptor::BootRecord(record) => {
                buf[0] = TYPE_BOOT_RECORD;
                buf[7..39].copy_from_slice(&record.boot_system_identifier);
                buf[39..71].copy_from_slice(&record.boot_identifier);
                let len = record.boot_system_use.len().min(2048 - 71);
                buf[71..71 + len].copy_from_slice(&record.boot_system_use[..len]);
            }
            VolumeDescriptor::Primary(pvd) => {
                buf[0] = TYPE_PRIMARY;
                write_body(&pvd.0, buf)?;
            }
            VolumeDescriptor::Supplementary(svd) => {
                buf[0] = TYPE_SUPPLEMENTARY;
                buf[6] = 1;
                buf[7] = svd.volume_flags;
                write_body(&svd.body, buf)?;
                let seq_len = svd.escape_sequences.len().min(32);
                buf[88..88 + seq_len].copy_from_slice(&svd.escape_sequences[..seq_len]);
            }
            VolumeDescriptor::Opaque { type_code, data } => {
                buf[0] = *type_code;
                buf[7..2048].copy_from_slice(data.as_ref());
            }
        }
        Ok(())
    }

    pub fn type_code(&self) -> u8 {
        match self {
            VolumeDescriptor::Primary(_) => TYPE_PRIMARY,
            VolumeDescriptor::Supplementary(_) => TYPE_SUPPLEMENTARY,
            VolumeDescriptor::BootRecord(_) => TYPE_BOOT_RECORD,
            VolumeDescriptor::Terminator => TYPE_TERMINATOR,
            VolumeDescriptor::Opaque { type_code, .. } => *type_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{FileFlags, Identifier};

    fn root_record() -> DirectoryRecord {
        DirectoryRecord {
            extended_attribute_length: 0,
            extent_location: 20,
            data_length: 2048,
            recording_time: crate::codec::RecordTimestamp::now(),
            flags: FileFlags::DIRECTORY,
            file_unit_size: 0,
            interleave_gap_size: 0,
            volume_sequence_number: 1,
            identifier: Identifier::SelfEntry,
            system_use: Vec::new(),
        }
    }

    fn sample_body() -> VolumeDescriptorBody {
        VolumeDescriptorBody {
            system_identifier: String::new(),
            volume_identifier: "TESTVOL".to_string(),
            volume_space_size: 100,
            volume_set_size: 1,
            volume_sequence_number: 1,
            logical_block_size: 2048,
            path_table_size: 10,
            type_l_path_table: 19,
            optional_type_l_path_table: 0,
            type_m_path_table: 19,
            optional_type_m_path_table: 0,
            root_directory_record: root_record(),
            volume_set_identifier: String::new(),
            publisher_identifier: String::new(),
            data_preparer_identifier: String::new(),
            application_identifier: String::new(),
            copyright_file_identifier: String::new(),
            abstract_file_identifier: String::new(),
            bibliographic_file_identifier: String::new(),
            creation_date_time: VolumeTimestamp::UNSPECIFIED,
            modification_date_time: VolumeTimestamp::UNSPECIFIED,
            expiration_date_time: VolumeTimestamp::UNSPECIFIED,
            effective_date_time: VolumeTimestamp::UNSPECIFIED,
            file_structure_version: 1,
            application_use: Vec::new(),
        }
    }

    #[test]
    fn primary_volume_descriptor_roundtrips() {
        let pvd = VolumeDescriptor::Primary(PrimaryVolumeDescriptor(sample_body()));
        let mut buf = [0u8; 2048];
        pvd.write(&mut buf).unwrap();
        let parsed = VolumeDescriptor::parse(&buf).unwrap();
        match parsed {
            VolumeDescriptor::Primary(parsed) => {
                assert_eq!(parsed.0.volume_identifier, "TESTVOL");
                assert_eq!(parsed.0.volume_space_size, 100);
            }
            other => panic!("expected Primary, got {other:?}"),
        }
    }

    #[test]
    fn supplementary_volume_descriptor_carries_joliet_escape() {
        let svd = VolumeDescriptor::Supplementary(SupplementaryVolumeDescriptor {
            volume_flags: 0,
            escape_sequences: b"%/E".to_vec(),
            joliet_level: Some(JolietLevel::Level3),
            body: sample_body(),
        });
        let mut buf = [0u8; 2048];
        svd.write(&mut buf).unwrap();
        let parsed = VolumeDescriptor::parse(&buf).unwrap();
        match parsed {
            VolumeDescriptor::Supplementary(parsed) => {
                assert_eq!(parsed.joliet_level, Some(JolietLevel::Level3));
            }
            other => panic!("expected Supplementary, got {other:?}"),
        }
    }

    #[test]
    fn terminator_roundtrips() {
        let mut buf = [0u8; 2048];
        VolumeDescriptor::Terminator.write(&mut buf).unwrap();
        assert!(matches!(
            VolumeDescriptor::parse(&buf).unwrap(),
            VolumeDescriptor::Terminator
        ));
    }

    #[test]
    fn missing_standard_identifier_is_format_error() {
        let buf = [0u8; 2048];
        let err = VolumeDescriptor::parse(&buf).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn wrong_descriptor_version_is_format_error() {
        let pvd = VolumeDescriptor::Primary(PrimaryVolumeDescriptor(sample_body()));
        let mut buf = [0u8; 2048];
        pvd.write(&mut buf).unwrap();
        buf[6] = 2;
        let err = VolumeDescriptor::parse(&buf).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }
}
