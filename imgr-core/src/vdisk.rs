//! Virtual block devices.
//!
//! The FAT driver never touches a host file directly; it reads and writes
//! through a [`BlockDevice`], which is either a pass-through over a raw image
//! or a qcow2 translator that maps guest offsets through the L1/L2 tables.
//! Only these two backing stores exist, so the device is a closed enum
//! rather than a trait object.

mod qcow2;
mod raw;

pub use self::qcow2::{ClusterMapping, QCOW2_MAGIC, Qcow2Disk, create_qcow2};
pub use self::raw::RawDisk;

use crate::error::{ImageError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug)]
pub enum BlockDevice {
    Raw(RawDisk),
    Qcow2(Qcow2Disk),
}

impl BlockDevice {
    /// Opens `path`, picking the qcow2 translator when the file starts with
    /// the qcow2 magic and a raw pass-through otherwise.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let mut magic = [0u8; 4];
        let is_qcow2 = {
            let mut f = File::open(path)?;
            f.read_exact(&mut magic).is_ok() && magic == QCOW2_MAGIC
        };
        if is_qcow2 {
            Ok(Self::Qcow2(Qcow2Disk::open(path, writable)?))
        } else {
            Ok(Self::Raw(RawDisk::open(path, writable)?))
        }
    }

    /// Sets the position of the next read or write. Not validated against
    /// [`length`](Self::length).
    pub fn seek(&mut self, pos: u64) {
        match self {
            Self::Raw(d) => d.seek(pos),
            Self::Qcow2(d) => d.seek(pos),
        }
    }

    /// Reads into `buf`, returning the number of bytes read. Returns fewer
    /// bytes only at the end of the device.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Raw(d) => d.read(buf),
            Self::Qcow2(d) => d.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Self::Raw(d) => d.write(buf),
            Self::Qcow2(d) => d.write(buf),
        }
    }

    /// Guest-visible size in bytes.
    pub fn length(&self) -> u64 {
        match self {
            Self::Raw(d) => d.length(),
            Self::Qcow2(d) => d.length(),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Self::Raw(d) => d.flush(),
            Self::Qcow2(d) => d.flush(),
        }
    }

    /// Flushes pending writes and releases the host file handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Reads exactly `buf.len()` bytes starting at `pos`.
    pub fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(pos);
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                return Err(ImageError::corrupt(format!(
                    "unexpected end of image at offset {}",
                    pos + done as u64
                )));
            }
            done += n;
        }
        Ok(())
    }

    pub fn write_all_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.seek(pos);
        self.write(buf)
    }
}
