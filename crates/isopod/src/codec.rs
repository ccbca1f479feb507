//! Byte-level codec for ISO 9660 primitive types: paired little/big endian
//! integers, fixed-width text fields, and the two ECMA-119 date-time
//! formats. Every read here verifies the invariants spec'd by ECMA-119
//! (endian pairs agreeing, characters in the declared set); callers turn a
//! codec failure into `Error::Format` naming the field.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::error::Error;
use crate::Result;

/// Read a `u16` stored as (LSB-first, MSB-first) and verify the two halves
/// agree, per ECMA-119 7.2.3.
pub fn read_u16_lsb_msb(field: &'static str, buf: &[u8]) -> Result<u16> {
    if buf.len() < 4 {
        return Err(Error::format(field, "buffer too small for lsb/msb u16"));
    }
    let lsb = u16::from_le_bytes([buf[0], buf[1]]);
    let msb = u16::from_be_bytes([buf[2], buf[3]]);
    if lsb != msb {
        return Err(Error::format(
            field,
            format!("little/big endian u16 mismatch: {lsb:#06x} != {msb:#06x}"),
        ));
    }
    Ok(lsb)
}

/// Write a `u16` as both little- and big-endian representations.
pub fn write_u16_lsb_msb(buf: &mut [u8], value: u16) {
    buf[0..2].copy_from_slice(&value.to_le_bytes());
    buf[2..4].copy_from_slice(&value.to_be_bytes());
}

/// Read a `u32` stored as (LSB-first, MSB-first) and verify the two halves
/// agree.
pub fn read_u32_lsb_msb(field: &'static str, buf: &[u8]) -> Result<u32> {
    if buf.len() < 8 {
        return Err(Error::format(field, "buffer too small for lsb/msb u32"));
    }
    let lsb = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let msb = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if lsb != msb {
        return Err(Error::format(
            field,
            format!("little/big endian u32 mismatch: {lsb:#010x} != {msb:#010x}"),
        ));
    }
    Ok(lsb)
}

/// Write a `u32` as both little- and big-endian representations.
pub fn write_u32_lsb_msb(buf: &mut [u8], value: u32) {
    buf[0..4].copy_from_slice(&value.to_le_bytes());
    buf[4..8].copy_from_slice(&value.to_be_bytes());
}

/// Read a plain little-endian `u32`, used by formats that store a single
/// encoding rather than the ISO 9660 both-endian convention (El Torito).
pub fn le_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[0..4].try_into().unwrap())
}

/// Verify every byte of `buf` is zero, as ECMA-119 requires of reserved and
/// unused fields.
pub fn verify_zero(field: &'static str, buf: &[u8]) -> Result<()> {
    if buf.iter().any(|&b| b != 0) {
        return Err(Error::format(field, "reserved/unused field is not zero"));
    }
    Ok(())
}

/// a-characters: uppercase letters, digits, space, and
/// `!"%&'()*+,-./:;<=>?_`.
pub fn is_a_character(c: u8) -> bool {
    matches!(c, b'A'..=b'Z' | b'0'..=b'9' | b' ')
        || matches!(
            c,
            b'!' | b'"'
                | b'%'
                | b'&'
                | b'\''
                | b'('
                | b')'
                | b'*'
                | b'+'
                | b','
                | b'-'
                | b'.'
                | b'/'
                | b':'
                | b';'
                | b'<'
                | b'='
                | b'>'
                | b'?'
                | b'_'
        )
}

/// d-characters: uppercase letters, digits, and `_`.
pub fn is_d_character(c: u8) -> bool {
    matches!(c, b'A'..=b'Z' | b'0'..=b'9' | b'_')
}

/// d1-characters: d-characters plus lowercase, for ISO level 4.
pub fn is_d1_character(c: u8) -> bool {
    is_d_character(c) || matches!(c, b'a'..=b'z')
}

/// Parse a fixed-width, space-padded text field, trimming trailing spaces.
pub fn read_text_field(buf: &[u8]) -> String {
    let end = buf
        .iter()
        .rposition(|&b| b != b' ')
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Write `s` into a fixed-width field, space-padded, uppercased, and with
/// any character outside `allowed` replaced by `_`.
pub fn write_text_field(buf: &mut [u8], s: &str, allowed: impl Fn(u8) -> bool) {
    buf.fill(b' ');
    let upper = s.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let len = bytes.len().min(buf.len());
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = if allowed(b) { b } else { b'_' };
    }
}

/// ECMA-119 8.4.26.1: the 17-byte ASCII volume timestamp
/// "YYYYMMDDHHMMSSCC" followed by a signed GMT offset in 15-minute units.
/// All-zero digits with `'0'` filler and a zero offset represents "not
/// specified" and round-trips as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTimestamp {
    pub datetime: Option<DateTime<Utc>>,
    pub hundredths: u8,
    pub gmt_offset_quarter_hours: i8,
}

impl VolumeTimestamp {
    pub const UNSPECIFIED: VolumeTimestamp = VolumeTimestamp {
        datetime: None,
        hundredths: 0,
        gmt_offset_quarter_hours: 0,
    };

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            datetime: Some(dt),
            hundredths: (dt.timestamp_subsec_millis() / 10) as u8,
            gmt_offset_quarter_hours: 0,
        }
    }

    pub fn read(field: &'static str, buf: &[u8]) -> Result<Self> {
        if buf.len() < 17 {
            return Err(Error::format(field, "volume timestamp field too short"));
        }
        let digits = &buf[..16];
        if digits.iter().all(|&b| b == b'0') {
            return Ok(Self::UNSPECIFIED);
        }
        let text = std::str::from_utf8(digits)
            .map_err(|_| Error::format(field, "volume timestamp is not ASCII"))?;
        let parse_part = |range: std::ops::Range<usize>| -> Result<u32> {
            text.get(range.clone())
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| Error::format(field, format!("invalid digits at {range:?}")))
        };
        let year = parse_part(0..4)?;
        let month = parse_part(4..6)?;
        let day = parse_part(6..8)?;
        let hour = parse_part(8..10)?;
        let minute = parse_part(10..12)?;
        let second = parse_part(12..14)?;
        let hundredths = parse_part(14..16)? as u8;
        let gmt_offset_quarter_hours = buf[16] as i8;

        let datetime = Utc
            .with_ymd_and_hms(year as i32, month, day, hour, minute, second)
            .single()
            .ok_or_else(|| Error::format(field, "volume timestamp is not a valid date"))?;

        Ok(Self {
            datetime: Some(datetime),
            hundredths,
            gmt_offset_quarter_hours,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        match self.datetime {
            None => {
                buf[..16].fill(b'0');
                buf[16] = 0;
            }
            Some(dt) => {
                let text = format!(
                    "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
                    dt.year(),
                    dt.month(),
                    dt.day(),
                    dt.hour(),
                    dt.minute(),
                    dt.second(),
                    self.hundredths
                );
                buf[..16].copy_from_slice(text.as_bytes());
                buf[16] = self.gmt_offset_quarter_hours as u8;
            }
        }
    }
}

/// ECMA-119 9.1.5: the 7-byte binary directory-record timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTimestamp {
    pub datetime: DateTime<Utc>,
    pub gmt_offset_quarter_hours: i8,
}

impl RecordTimestamp {
    pub fn read(field: &'static str, buf: &[u8]) -> Result<Self> {
        if buf.len() < 7 {
            return Err(Error::format(field, "record timestamp field too short"));
        }
        let year = 1900 + buf[0] as i32;
        let (month, day, hour, minute, second) = (
            buf[1] as u32,
            buf[2] as u32,
            buf[3] as u32,
            buf[4] as u32,
            buf[5] as u32,
        );
        let datetime = Utc
            .with_ymd_and_hms(year, month.max(1), day.max(1), hour, minute, second)
            .single()
            .ok_or_else(|| Error::format(field, "record timestamp is not a valid date"))?;
        Ok(Self {
            datetime,
            gmt_offset_quarter_hours: buf[6] as i8,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        let dt = self.datetime;
        buf[0] = (dt.year() - 1900).clamp(0, 255) as u8;
        buf[1] = dt.month() as u8;
        buf[2] = dt.day() as u8;
        buf[3] = dt.hour() as u8;
        buf[4] = dt.minute() as u8;
        buf[5] = dt.second() as u8;
        buf[6] = self.gmt_offset_quarter_hours as u8;
    }

    pub fn now() -> Self {
        Self {
            datetime: Utc::now(),
            gmt_offset_quarter_hours: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsb_msb_u16_roundtrip() {
        let mut buf = [0u8; 4];
        write_u16_lsb_msb(&mut buf, 0x1234);
        assert_eq!(read_u16_lsb_msb("test", &buf).unwrap(), 0x1234);
    }

    #[test]
    fn lsb_msb_u16_mismatch_is_format_error() {
        let mut buf = [0u8; 4];
        write_u16_lsb_msb(&mut buf, 0x1234);
        buf[2] ^= 0xff;
        assert!(matches!(
            read_u16_lsb_msb("test", &buf),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn lsb_msb_u32_roundtrip() {
        let mut buf = [0u8; 8];
        write_u32_lsb_msb(&mut buf, 0xdead_beef);
        assert_eq!(read_u32_lsb_msb("test", &buf).unwrap(), 0xdead_beef);
    }

    #[test]
    fn text_field_trims_trailing_spaces() {
        let mut buf = [b' '; 32];
        write_text_field(&mut buf, "hello world", is_d_character);
        assert_eq!(read_text_field(&buf), "HELLO_WORLD");
    }

    #[test]
    fn volume_timestamp_unspecified_roundtrips() {
        let mut buf = [0u8; 17];
        VolumeTimestamp::UNSPECIFIED.write(&mut buf);
        let parsed = VolumeTimestamp::read("test", &buf).unwrap();
        assert_eq!(parsed, VolumeTimestamp::UNSPECIFIED);
    }

    #[test]
    fn record_timestamp_roundtrips() {
        let ts = RecordTimestamp {
            datetime: Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 45).unwrap(),
            gmt_offset_quarter_hours: 4,
        };
        let mut buf = [0u8; 7];
        ts.write(&mut buf);
        let parsed = RecordTimestamp::read("test", &buf).unwrap();
        assert_eq!(parsed, ts);
    }
}
