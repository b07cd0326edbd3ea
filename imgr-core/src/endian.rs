//! Fixed-width integer access on byte buffers.
//!
//! All readers take an offset into the buffer and panic if the buffer is too
//! short; callers slice records to a known size before decoding them.
//! ISO 9660 additionally stores many fields "both-endian": the little-endian
//! encoding immediately followed by the big-endian one.
use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub fn le_u16(buf: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&buf[off..])
}

pub fn le_u32(buf: &[u8], off: usize) -> u32 {
    LittleEndian::read_u32(&buf[off..])
}

pub fn be_u16(buf: &[u8], off: usize) -> u16 {
    BigEndian::read_u16(&buf[off..])
}

pub fn be_u32(buf: &[u8], off: usize) -> u32 {
    BigEndian::read_u32(&buf[off..])
}

pub fn be_u64(buf: &[u8], off: usize) -> u64 {
    BigEndian::read_u64(&buf[off..])
}

pub fn put_le_u16(buf: &mut [u8], off: usize, val: u16) {
    LittleEndian::write_u16(&mut buf[off..], val);
}

pub fn put_le_u32(buf: &mut [u8], off: usize, val: u32) {
    LittleEndian::write_u32(&mut buf[off..], val);
}

pub fn put_be_u16(buf: &mut [u8], off: usize, val: u16) {
    BigEndian::write_u16(&mut buf[off..], val);
}

pub fn put_be_u32(buf: &mut [u8], off: usize, val: u32) {
    BigEndian::write_u32(&mut buf[off..], val);
}

pub fn put_be_u64(buf: &mut [u8], off: usize, val: u64) {
    BigEndian::write_u64(&mut buf[off..], val);
}

/// Writes a 4-byte both-endian field (LE u16 then BE u16).
pub fn put_both_u16(buf: &mut [u8], off: usize, val: u16) {
    put_le_u16(buf, off, val);
    put_be_u16(buf, off + 2, val);
}

/// Writes an 8-byte both-endian field (LE u32 then BE u32).
pub fn put_both_u32(buf: &mut [u8], off: usize, val: u32) {
    put_le_u32(buf, off, val);
    put_be_u32(buf, off + 4, val);
}

/// Reads an 8-byte both-endian field.
///
/// Only the little-endian half is consulted; mastering tools are known to
/// leave the big-endian half zeroed.
pub fn both_u32(buf: &[u8], off: usize) -> u32 {
    le_u32(buf, off)
}
