//! Joliet name encoding: UCS-2BE text, used for the Supplementary Volume
//! Descriptor's identifier fields and for file/directory identifiers in
//! the Joliet directory tree.

use crate::error::Error;
use crate::Result;

/// Decode a fixed-width, space-padded UCS-2BE field (used by the SVD's
/// text identifiers) into a `String`, trimming trailing U+0020 code units.
pub fn read_text_field(field: &'static str, buf: &[u8]) -> Result<String> {
    if buf.len() % 2 != 0 {
        return Err(Error::format(field, "UCS-2BE field has an odd byte length"));
    }
    let units: Vec<u16> = buf.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
    let end = units.iter().rposition(|&u| u != 0x0020).map(|i| i + 1).unwrap_or(0);
    String::from_utf16(&units[..end]).map_err(|_| Error::format(field, "invalid UTF-16 in UCS-2BE field"))
}

/// Encode `s` into a fixed-width UCS-2BE field, space-padded on the right.
/// Characters outside the Basic Multilingual Plane cannot be represented
/// and are replaced with `U+FFFD`.
pub fn write_text_field(buf: &mut [u8], s: &str) {
    debug_assert_eq!(buf.len() % 2, 0);
    let capacity = buf.len() / 2;
    let mut units: Vec<u16> = s.encode_utf16().collect();
    units.truncate(capacity);
    for (i, chunk) in buf.chunks_exact_mut(2).enumerate() {
        let unit = units.get(i).copied().unwrap_or(0x0020);
        chunk.copy_from_slice(&unit.to_be_bytes());
    }
}

/// Decode a Joliet directory identifier: UCS-2BE name bytes as stored in
/// a directory record, with no trailing-space trimming (unlike the SVD's
/// fixed-width text fields, identifiers are exactly as long as declared).
pub fn decode_identifier(field: &'static str, bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::format(field, "Joliet identifier has an odd byte length"));
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
    String::from_utf16(&units).map_err(|_| Error::format(field, "invalid UTF-16 in Joliet identifier"))
}

/// Encode a name into Joliet identifier bytes (no padding; the caller
/// determines the directory-record identifier length field from this).
pub fn encode_identifier(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_field_roundtrips_and_trims_spaces() {
        let mut buf = [0u8; 16];
        write_text_field(&mut buf, "hello");
        let decoded = read_text_field("test", &buf).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn identifier_roundtrips_unicode() {
        let bytes = encode_identifier("café");
        let decoded = decode_identifier("test", &bytes).unwrap();
        assert_eq!(decoded, "café");
    }

    #[test]
    fn odd_length_field_is_format_error() {
        let buf = [0u8; 3];
        assert!(read_text_field("test", &buf).is_err());
    }
}
