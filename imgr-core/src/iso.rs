//! ISO 9660 (ECMA-119) reader and authoring.
//!
//! ISO images have no indirection layer, so both halves work directly on the
//! host file: [`IsoImage`] walks the directory records of an existing image
//! and [`create_iso`] lays out and writes a new one from a host tree.
mod read;
mod write;

pub use self::read::IsoImage;
pub(crate) use self::write::create_iso;

use crate::endian::both_u32;
use crate::error::{ImageError, Result};
use crate::util::calendar_time;
use time::OffsetDateTime;

pub const SECTOR_SIZE: u64 = 2048;
/// The volume descriptor set starts after the 32 KiB system area.
pub const FIRST_DESCRIPTOR_SECTOR: u64 = 16;
pub const STANDARD_ID: &[u8; 5] = b"CD001";

const VD_PRIMARY: u8 = 1;
const VD_TERMINATOR: u8 = 255;

/// Offset of the root directory record inside the primary volume descriptor.
const PVD_ROOT_RECORD: usize = 156;
/// Fixed part of a directory record, before the identifier.
const RECORD_HEADER_LEN: usize = 33;
const FLAG_DIRECTORY: u8 = 0x02;

/// One decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IsoRecord {
    extent: u32,
    size: u32,
    is_dir: bool,
    /// Identifier with any `;version` suffix removed; `.` and `..` for the
    /// self and parent pseudo-entries.
    name: String,
    recorded: Option<OffsetDateTime>,
}

impl IsoRecord {
    /// Decodes the record at the start of `raw`, whose first byte is its
    /// length.
    fn decode(raw: &[u8]) -> Result<Self> {
        let len = usize::from(raw[0]);
        if len < RECORD_HEADER_LEN + 1 || len > raw.len() {
            return Err(ImageError::corrupt(format!(
                "directory record length {len} is out of range"
            )));
        }
        let name_len = usize::from(raw[32]);
        if RECORD_HEADER_LEN + name_len > len {
            return Err(ImageError::corrupt(
                "directory record identifier overruns the record",
            ));
        }
        let ident = &raw[RECORD_HEADER_LEN..RECORD_HEADER_LEN + name_len];
        let is_dir = raw[25] & FLAG_DIRECTORY != 0;

        let name = match ident {
            [0] => ".".to_string(),
            [1] => "..".to_string(),
            _ => {
                let text = String::from_utf8_lossy(ident);
                let text = text.split(';').next().unwrap_or_default();
                if is_dir {
                    text.to_string()
                } else {
                    text.trim_end_matches('.').to_string()
                }
            }
        };

        Ok(Self {
            extent: both_u32(raw, 2),
            size: both_u32(raw, 10),
            is_dir,
            name,
            recorded: decode_recording_date(&raw[18..25]),
        })
    }

    fn is_special(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Decodes the 7-byte recording date: years since 1900, month, day, hour,
/// minute, second and a GMT offset in 15-minute units.
fn decode_recording_date(d: &[u8]) -> Option<OffsetDateTime> {
    let offset = i32::from(d[6] as i8) * 15;
    calendar_time(1900 + i32::from(d[0]), d[1], d[2], d[3], d[4], d[5], offset)
}

fn encode_recording_date(t: OffsetDateTime) -> [u8; 7] {
    let offset = t.offset().whole_minutes() / 15;
    let year = (t.year() - 1900).clamp(0, 255) as u8;
    [
        year,
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        offset as i8 as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &[u8], flags: u8) -> Vec<u8> {
        let len = (RECORD_HEADER_LEN + name.len() + 1) & !1;
        let mut raw = vec![0u8; len];
        raw[0] = len as u8;
        crate::endian::put_both_u32(&mut raw, 2, 40);
        crate::endian::put_both_u32(&mut raw, 10, 1234);
        raw[18..25].copy_from_slice(&[124, 3, 15, 10, 20, 30, 4]);
        raw[25] = flags;
        raw[32] = name.len() as u8;
        raw[33..33 + name.len()].copy_from_slice(name);
        raw
    }

    #[test]
    fn decodes_file_records() {
        let rec = IsoRecord::decode(&record(b"README.TXT;1", 0)).unwrap();
        assert_eq!(rec.name, "README.TXT");
        assert_eq!(rec.extent, 40);
        assert_eq!(rec.size, 1234);
        assert!(!rec.is_dir);

        let t = rec.recorded.unwrap();
        assert_eq!((t.year(), u8::from(t.month()), t.day()), (2024, 3, 15));
        assert_eq!(t.offset().whole_minutes(), 60);
    }

    #[test]
    fn strips_trailing_dot_of_extensionless_files() {
        let rec = IsoRecord::decode(&record(b"MAKEFILE.;1", 0)).unwrap();
        assert_eq!(rec.name, "MAKEFILE");
    }

    #[test]
    fn recognises_pseudo_entries() {
        let dot = IsoRecord::decode(&record(&[0], FLAG_DIRECTORY)).unwrap();
        let dotdot = IsoRecord::decode(&record(&[1], FLAG_DIRECTORY)).unwrap();
        assert!(dot.is_special() && dot.is_dir);
        assert_eq!(dotdot.name, "..");
    }

    #[test]
    fn rejects_overrunning_identifier() {
        let mut raw = record(b"A.TXT;1", 0);
        raw[32] = 60;
        assert!(matches!(IsoRecord::decode(&raw), Err(ImageError::Corrupt(_))));
    }

    #[test]
    fn recording_date_round_trips() {
        let t = calendar_time(2001, 9, 9, 1, 46, 40, -300).unwrap();
        assert_eq!(decode_recording_date(&encode_recording_date(t)), Some(t));
    }
}
