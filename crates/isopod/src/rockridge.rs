//! SUSP (IEEE P1281) system use entries and the Rock Ridge extensions
//! built on top of them: POSIX attributes, long names, symbolic links,
//! and the deep-directory relocation triad (CL/PL/RE).

use crate::codec;
use crate::error::Error;
use crate::Result;

/// One System Use Area entry in its raw, not-yet-interpreted form.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub signature: [u8; 2],
    pub version: u8,
    pub data: Vec<u8>,
}

/// Parse a flat run of SUSP entries (no CE-following), stopping at the
/// first entry too short to contain a header or a zero-length pair (the
/// conventional end-of-area padding).
pub fn parse_raw_entries(field: &'static str, buf: &[u8]) -> Result<Vec<RawEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + 4 <= buf.len() {
        let signature = [buf[offset], buf[offset + 1]];
        if signature == [0, 0] {
            break;
        }
        let length = buf[offset + 2] as usize;
        if length < 4 || offset + length > buf.len() {
            return Err(Error::format(field, "SUSP entry length out of range"));
        }
        let version = buf[offset + 3];
        let data = buf[offset + 4..offset + length].to_vec();
        entries.push(RawEntry {
            signature,
            version,
            data,
        });
        offset += length;
    }
    Ok(entries)
}

/// A source of continuation-area bytes, so [`resolve_entries`] can follow
/// `CE` entries without this module knowing how extents are stored.
pub trait ContinuationSource {
    fn read_continuation(&mut self, extent: u32, offset: u32, len: u32) -> Result<Vec<u8>>;
}

/// Follow every `CE` entry to completion, returning the full, flattened
/// entry list across the directory record and all continuation areas.
pub fn resolve_entries(
    field: &'static str,
    initial: &[u8],
    source: &mut impl ContinuationSource,
) -> Result<Vec<RawEntry>> {
    let mut all = Vec::new();
    let mut current = parse_raw_entries(field, initial)?;
    loop {
        let ce = current.iter().find(|e| &e.signature == b"CE").cloned();
        all.extend(current.into_iter().filter(|e| &e.signature != b"CE"));
        match ce {
            None => break,
            Some(ce) => {
                if ce.data.len() < 24 {
                    return Err(Error::format(field, "CE entry shorter than required"));
                }
                let extent = codec::read_u32_lsb_msb(field, &ce.data[0..8])?;
                let offset = codec::read_u32_lsb_msb(field, &ce.data[8..16])?;
                let len = codec::read_u32_lsb_msb(field, &ce.data[16..24])?;
                let bytes = source.read_continuation(extent, offset, len)?;
                current = parse_raw_entries(field, &bytes)?;
            }
        }
    }
    Ok(all)
}

bitflags::bitflags! {
    /// Flags byte shared by `NM` and `SL` continuation semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NameFlags: u8 {
        const CONTINUE = 1 << 0;
        const CURRENT = 1 << 1;
        const PARENT = 1 << 2;
    }
}

/// POSIX attributes carried by a `PX` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixAttributes {
    pub mode: u32,
    pub links: u32,
    pub uid: u32,
    pub gid: u32,
    pub serial_number: Option<u32>,
}

/// One component of an `SL` symbolic link target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkComponent {
    Current,
    Parent,
    Root,
    Named(Vec<u8>),
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimestampFlags: u8 {
        const CREATION = 1 << 0;
        const MODIFY = 1 << 1;
        const ACCESS = 1 << 2;
        const ATTRIBUTES = 1 << 3;
        const BACKUP = 1 << 4;
        const EXPIRATION = 1 << 5;
        const EFFECTIVE = 1 << 6;
        const LONG_FORM = 1 << 7;
    }
}

/// The fully-resolved Rock Ridge attributes for one directory record,
/// assembled from its (possibly CE-continued) system use entries.
#[derive(Debug, Clone, Default)]
pub struct RockRidgeAttributes {
    pub posix: Option<PosixAttributes>,
    pub name: Option<Vec<u8>>,
    pub symlink_target: Option<Vec<LinkComponent>>,
    pub relocated_child: Option<u32>,
    pub relocated_parent: Option<u32>,
    pub is_relocation_placeholder: bool,
    pub timestamps: Vec<(TimestampFlags, codec::RecordTimestamp)>,
    /// POSIX device node major/minor numbers from a `PN` entry.
    pub device_number: Option<(u32, u32)>,
}

fn read_px(field: &'static str, data: &[u8]) -> Result<PosixAttributes> {
    if data.len() < 32 {
        return Err(Error::format(field, "PX entry shorter than required"));
    }
    let mode = codec::read_u32_lsb_msb(field, &data[0..8])?;
    let links = codec::read_u32_lsb_msb(field, &data[8..16])?;
    let uid = codec::read_u32_lsb_msb(field, &data[16..24])?;
    let gid = codec::read_u32_lsb_msb(field, &data[24..32])?;
    let serial_number = if data.len() >= 40 {
        Some(codec::read_u32_lsb_msb(field, &data[32..40])?)
    } else {
        None
    };
    Ok(PosixAttributes {
        mode,
        links,
        uid,
        gid,
        serial_number,
    })
}

fn write_px(attrs: &PosixAttributes) -> Vec<u8> {
    let len = if attrs.serial_number.is_some() { 40 } else { 32 };
    let mut data = vec![0u8; len];
    codec::write_u32_lsb_msb(&mut data[0..8], attrs.mode);
    codec::write_u32_lsb_msb(&mut data[8..16], attrs.links);
    codec::write_u32_lsb_msb(&mut data[16..24], attrs.uid);
    codec::write_u32_lsb_msb(&mut data[24..32], attrs.gid);
    if let Some(serial) = attrs.serial_number {
        codec::write_u32_lsb_msb(&mut data[32..40], serial);
    }
    data
}

fn read_pn(field: &'static str, data: &[u8]) -> Result<(u32, u32)> {
    if data.len() < 16 {
        return Err(Error::format(field, "PN entry shorter than required"));
    }
    let high = codec::read_u32_lsb_msb(field, &data[0..8])?;
    let low = codec::read_u32_lsb_msb(field, &data[8..16])?;
    Ok((high, low))
}

fn parse_sl_components(data: &[u8]) -> Vec<LinkComponent> {
    let mut components = Vec::new();
    let mut offset = 0;
    while offset + 2 <= data.len() {
        let flags = data[offset];
        let len = data[offset + 1] as usize;
        if offset + 2 + len > data.len() {
            break;
        }
        let content = &data[offset + 2..offset + 2 + len];
        components.push(if flags & 0x02 != 0 {
            LinkComponent::Current
        } else if flags & 0x04 != 0 {
            LinkComponent::Parent
        } else if flags & 0x08 != 0 {
            LinkComponent::Root
        } else {
            LinkComponent::Named(content.to_vec())
        });
        offset += 2 + len;
    }
    components
}

/// Fold a list of resolved SUSP entries into the attribute set this
/// library exposes; the raw entries are consumed in order so a `NM`/`SL`
/// split across a continuation still concatenates correctly.
pub fn assemble_attributes(field: &'static str, entries: &[RawEntry]) -> Result<RockRidgeAttributes> {
    let mut attrs = RockRidgeAttributes::default();
    let mut name = Vec::new();
    let mut saw_name = false;
    let mut symlink = Vec::new();
    let mut saw_symlink = false;

    for entry in entries {
        match &entry.signature {
            b"PX" => attrs.posix = Some(read_px(field, &entry.data)?),
            b"NM" => {
                if entry.data.is_empty() {
                    return Err(Error::format(field, "NM entry has no flags byte"));
                }
                saw_name = true;
                name.extend_from_slice(&entry.data[1..]);
            }
            b"SL" => {
                if entry.data.is_empty() {
                    return Err(Error::format(field, "SL entry has no flags byte"));
                }
                saw_symlink = true;
                symlink.extend(parse_sl_components(&entry.data[1..]));
            }
            b"CL" => {
                attrs.relocated_child = Some(codec::read_u32_lsb_msb(field, &entry.data)?);
            }
            b"PL" => {
                attrs.relocated_parent = Some(codec::read_u32_lsb_msb(field, &entry.data)?);
            }
            b"PN" => {
                attrs.device_number = Some(read_pn(field, &entry.data)?);
            }
            b"RE" => attrs.is_relocation_placeholder = true,
            b"TF" => {
                if entry.data.is_empty() {
                    return Err(Error::format(field, "TF entry has no flags byte"));
                }
                let flags = TimestampFlags::from_bits_truncate(entry.data[0]);
                let stride = if flags.contains(TimestampFlags::LONG_FORM) { 17 } else { 7 };
                let mut offset = 1;
                for kind in [
                    TimestampFlags::CREATION,
                    TimestampFlags::MODIFY,
                    TimestampFlags::ACCESS,
                    TimestampFlags::ATTRIBUTES,
                    TimestampFlags::BACKUP,
                    TimestampFlags::EXPIRATION,
                    TimestampFlags::EFFECTIVE,
                ] {
                    if flags.contains(kind) {
                        if offset + stride > entry.data.len() {
                            return Err(Error::format(field, "TF entry shorter than its flags imply"));
                        }
                        if stride == 7 {
                            let ts = codec::RecordTimestamp::read(field, &entry.data[offset..offset + 7])?;
                            attrs.timestamps.push((kind, ts));
                        }
                        offset += stride;
                    }
                }
            }
            b"SP" | b"ER" | b"CE" => {}
            _ => {}
        }
    }

    if saw_name {
        attrs.name = Some(name);
    }
    if saw_symlink {
        attrs.symlink_target = Some(symlink);
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sig: &[u8; 2], data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(sig);
        buf.push((4 + data.len()) as u8);
        buf.push(1);
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn parses_px_entry() {
        let mut px_data = vec![0u8; 32];
        codec::write_u32_lsb_msb(&mut px_data[0..8], 0o100644);
        codec::write_u32_lsb_msb(&mut px_data[8..16], 1);
        codec::write_u32_lsb_msb(&mut px_data[16..24], 1000);
        codec::write_u32_lsb_msb(&mut px_data[24..32], 1000);
        let buf = entry(b"PX", &px_data);
        let entries = parse_raw_entries("test", &buf).unwrap();
        let attrs = assemble_attributes("test", &entries).unwrap();
        assert_eq!(attrs.posix.unwrap().mode, 0o100644);
    }

    #[test]
    fn concatenates_split_nm_entries() {
        let mut buf = Vec::new();
        buf.extend(entry(b"NM", &[0x01, b'f', b'o']));
        buf.extend(entry(b"NM", &[0x00, b'o']));
        let entries = parse_raw_entries("test", &buf).unwrap();
        let attrs = assemble_attributes("test", &entries).unwrap();
        assert_eq!(attrs.name.unwrap(), b"foo");
    }

    #[test]
    fn relocation_triad_is_captured() {
        let mut cl_data = vec![0u8; 8];
        codec::write_u32_lsb_msb(&mut cl_data, 42);
        let mut buf = Vec::new();
        buf.extend(entry(b"CL", &cl_data));
        buf.extend(entry(b"RE", &[]));
        let entries = parse_raw_entries("test", &buf).unwrap();
        let attrs = assemble_attributes("test", &entries).unwrap();
        assert_eq!(attrs.relocated_child, Some(42));
        assert!(attrs.is_relocation_placeholder);
    }

    #[test]
    fn parses_pn_entry() {
        let mut pn_data = vec![0u8; 16];
        codec::write_u32_lsb_msb(&mut pn_data[0..8], 0);
        codec::write_u32_lsb_msb(&mut pn_data[8..16], 259);
        let buf = entry(b"PN", &pn_data);
        let entries = parse_raw_entries("test", &buf).unwrap();
        let attrs = assemble_attributes("test", &entries).unwrap();
        assert_eq!(attrs.device_number, Some((0, 259)));
    }

    #[test]
    fn symlink_components_classify_dot_and_dotdot() {
        let mut sl_data = vec![0x00u8];
        sl_data.push(0x02);
        sl_data.push(0);
        sl_data.push(0x00);
        sl_data.push(3);
        sl_data.extend_from_slice(b"bin");
        let buf = entry(b"SL", &sl_data);
        let entries = parse_raw_entries("test", &buf).unwrap();
        let attrs = assemble_attributes("test", &entries).unwrap();
        let target = attrs.symlink_target.unwrap();
        assert_eq!(target[0], LinkComponent::Current);
        assert_eq!(target[1], LinkComponent::Named(b"bin".to_vec()));
    }
}
