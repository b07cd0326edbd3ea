use crate::error::{ImageError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A pass-through device over a raw image file.
#[derive(Debug)]
pub struct RawDisk {
    file: File,
    pos: u64,
    len: u64,
    writable: bool,
}

impl RawDisk {
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            pos: 0,
            len,
            writable,
        })
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let want = buf
            .len()
            .min(usize::try_from(self.len - self.pos).unwrap_or(usize::MAX));
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut buf[..want])?;
        self.pos += want as u64;
        Ok(want)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(ImageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.write_all(buf)?;
        self.pos += buf.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(())
    }

    pub fn length(&self) -> u64 {
        self.len
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
