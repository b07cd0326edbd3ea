//! 32-byte FAT directory entries and 8.3 short names.
use super::boot::FatType;
use crate::endian::{le_u16, le_u32, put_le_u16, put_le_u32};
use crate::util::calendar_time;
use std::collections::HashSet;
use time::OffsetDateTime;

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

const SLOT_END: u8 = 0x00;
const SLOT_DELETED: u8 = 0xE5;
// A leading 0xE5 in a real name is stored as 0x05.
const SLOT_KANJI_E5: u8 = 0x05;

pub const DOT_NAME: [u8; 11] = *b".          ";
pub const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// A live short-name entry read from a directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub short: [u8; 11],
    pub attr: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub modified: Option<OffsetDateTime>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}

/// Classification of one raw directory slot.
#[derive(Debug)]
pub enum Slot {
    /// No further entries in this directory.
    End,
    /// Deleted entry, reusable.
    Free,
    /// Long-name fragment, volume label, or `.`/`..`.
    Skip,
    Entry(DirEntry),
}

pub fn parse_slot(raw: &[u8], fat_type: FatType) -> Slot {
    match raw[0] {
        SLOT_END => return Slot::End,
        SLOT_DELETED => return Slot::Free,
        _ => {}
    }

    let attr = raw[11];
    if attr & 0x3F == ATTR_LONG_NAME || attr & ATTR_VOLUME_ID != 0 {
        return Slot::Skip;
    }

    let mut short = [0u8; 11];
    short.copy_from_slice(&raw[..11]);
    let name = display_name(&short);
    if name == "." || name == ".." {
        return Slot::Skip;
    }

    let high = if fat_type == FatType::Fat32 {
        u32::from(le_u16(raw, 20)) << 16
    } else {
        0
    };
    let is_dir = attr & ATTR_DIRECTORY != 0;

    Slot::Entry(DirEntry {
        name,
        short,
        attr,
        first_cluster: high | u32::from(le_u16(raw, 26)),
        size: if is_dir { 0 } else { le_u32(raw, 28) },
        modified: decode_datetime(le_u16(raw, 24), le_u16(raw, 22)),
    })
}

/// Renders an 11-byte short name as `NAME.EXT`.
pub fn display_name(short: &[u8; 11]) -> String {
    let decode = |bytes: &[u8]| -> String {
        bytes
            .iter()
            .map(|&b| char::from(b))
            .collect::<String>()
            .trim_end_matches(' ')
            .to_string()
    };

    let mut base = short[..8].to_vec();
    if base[0] == SLOT_KANJI_E5 {
        base[0] = SLOT_DELETED;
    }
    let base = decode(&base);
    let ext = decode(&short[8..]);
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

pub fn encode_entry(
    short: &[u8; 11],
    attr: u8,
    first_cluster: u32,
    size: u32,
    modified: OffsetDateTime,
) -> [u8; DIR_ENTRY_SIZE] {
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    raw[..11].copy_from_slice(short);
    raw[11] = attr;
    let (date, time) = encode_datetime(modified);
    put_le_u16(&mut raw, 14, time); // created
    put_le_u16(&mut raw, 16, date);
    put_le_u16(&mut raw, 18, date); // accessed
    put_le_u16(&mut raw, 20, (first_cluster >> 16) as u16);
    put_le_u16(&mut raw, 22, time);
    put_le_u16(&mut raw, 24, date);
    put_le_u16(&mut raw, 26, first_cluster as u16);
    put_le_u32(&mut raw, 28, size);
    raw
}

fn decode_datetime(date: u16, time: u16) -> Option<OffsetDateTime> {
    if date == 0 {
        return None;
    }
    calendar_time(
        1980 + i32::from(date >> 9),
        ((date >> 5) & 0x0F) as u8,
        (date & 0x1F) as u8,
        (time >> 11) as u8,
        ((time >> 5) & 0x3F) as u8,
        ((time & 0x1F) * 2) as u8,
        0,
    )
}

/// FAT (date, time) fields; clamped to the representable 1980..=2107 range.
fn encode_datetime(t: OffsetDateTime) -> (u16, u16) {
    let t = t.to_offset(time::UtcOffset::UTC);
    if t.year() < 1980 {
        return ((1 << 5) | 1, 0);
    }
    let year = (t.year() - 1980).min(127) as u16;
    let date = (year << 9) | (u16::from(u8::from(t.month())) << 5) | u16::from(t.day());
    let time =
        (u16::from(t.hour()) << 11) | (u16::from(t.minute()) << 5) | u16::from(t.second() / 2);
    (date, time)
}

fn short_char(c: char) -> Option<u8> {
    match c.to_ascii_uppercase() {
        c @ ('A'..='Z' | '0'..='9') => Some(c as u8),
        c @ ('!' | '#' | '$' | '%' | '&' | '\'' | '(' | ')' | '-' | '@' | '^' | '_' | '`' | '{'
        | '}' | '~') => Some(c as u8),
        ' ' | '.' => None,
        _ => Some(b'_'),
    }
}

/// Derives a unique 8.3 name for `host_name` among the names already `taken`
/// in the target directory.
pub fn short_name(host_name: &str, taken: &HashSet<[u8; 11]>) -> [u8; 11] {
    let trimmed = host_name.trim_start_matches('.');
    let (base, ext) = match trimmed.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (b, e),
        _ => (trimmed, ""),
    };

    let base_chars: Vec<u8> = base.chars().filter_map(short_char).collect();
    let ext_chars: Vec<u8> = ext.chars().filter_map(short_char).collect();
    let verbatim = |c: char| c.is_ascii() && short_char(c) == Some(c.to_ascii_uppercase() as u8);
    let lossy = base_chars.len() > 8
        || ext_chars.len() > 3
        || base_chars.is_empty()
        || !base.chars().all(verbatim)
        || !ext.chars().all(verbatim)
        || trimmed.len() != host_name.len();

    let mut ext_field = [b' '; 3];
    for (dst, src) in ext_field.iter_mut().zip(&ext_chars) {
        *dst = *src;
    }
    let base_chars = if base_chars.is_empty() {
        vec![b'_']
    } else {
        base_chars
    };

    let compose = |stem: &[u8], tail: &[u8]| -> [u8; 11] {
        let mut out = [b' '; 11];
        let keep = stem.len().min(8 - tail.len());
        out[..keep].copy_from_slice(&stem[..keep]);
        out[keep..keep + tail.len()].copy_from_slice(tail);
        out[8..].copy_from_slice(&ext_field);
        out
    };

    let plain = compose(&base_chars, &[]);
    if !lossy && !taken.contains(&plain) {
        return plain;
    }
    for n in 1u32..1_000_000 {
        let tail = format!("~{n}");
        let candidate = compose(&base_chars, tail.as_bytes());
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
    plain
}
