use super::{
    FIRST_DESCRIPTOR_SECTOR, IsoRecord, PVD_ROOT_RECORD, SECTOR_SIZE, STANDARD_ID, VD_PRIMARY,
    VD_TERMINATOR,
};
use crate::endian::{both_u32, le_u16};
use crate::entry::Entry;
use crate::error::{ImageError, Result};
use crate::task::Task;
use crate::util::{copy_exact, join_entry_path, path_components, safe_join, system_time};
use crate::{MAX_DEPTH, MAX_ENTRIES};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// Descriptors scanned before giving up on finding the terminator.
const MAX_DESCRIPTORS: u64 = 64;
/// Directories larger than this are treated as corrupt.
const MAX_DIR_LEN: u32 = 16 * 1024 * 1024;

/// An ISO 9660 image opened for reading.
pub struct IsoImage {
    file: File,
    len: u64,
    root: IsoRecord,
    volume_id: String,
    volume_sectors: u32,
}

impl IsoImage {
    /// Opens `path` and locates the primary volume descriptor.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut sector = vec![0u8; SECTOR_SIZE as usize];

        for index in 0..MAX_DESCRIPTORS {
            let pos = (FIRST_DESCRIPTOR_SECTOR + index) * SECTOR_SIZE;
            if pos + SECTOR_SIZE > len {
                break;
            }
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut sector)?;
            if &sector[1..6] != STANDARD_ID {
                if index == 0 {
                    return Err(ImageError::BadSignature("ISO 9660"));
                }
                return Err(ImageError::corrupt(format!(
                    "volume descriptor {index} lacks the CD001 identifier"
                )));
            }

            match sector[0] {
                VD_TERMINATOR => break,
                VD_PRIMARY => {
                    let block_size = le_u16(&sector, 128);
                    if u64::from(block_size) != SECTOR_SIZE {
                        return Err(ImageError::Unsupported("logical block size other than 2048"));
                    }
                    let root = IsoRecord::decode(&sector[PVD_ROOT_RECORD..PVD_ROOT_RECORD + 34])?;
                    let volume_id = String::from_utf8_lossy(&sector[40..72]).trim_end().to_string();
                    let volume_sectors = both_u32(&sector, 80);
                    debug!(
                        %volume_id,
                        volume_sectors,
                        root_extent = root.extent,
                        "found primary volume descriptor"
                    );
                    return Ok(Self {
                        file,
                        len,
                        root,
                        volume_id,
                        volume_sectors,
                    });
                }
                other => debug!(descriptor = other, "skipping volume descriptor"),
            }
        }

        if len < (FIRST_DESCRIPTOR_SECTOR + 1) * SECTOR_SIZE {
            return Err(ImageError::BadSignature("ISO 9660"));
        }
        Err(ImageError::corrupt("no primary volume descriptor"))
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    /// Volume size in sectors as declared by the primary volume descriptor.
    pub fn volume_sectors(&self) -> u32 {
        self.volume_sectors
    }

    fn check_extent(&self, rec: &IsoRecord) -> Result<u64> {
        let start = u64::from(rec.extent) * SECTOR_SIZE;
        if rec.size > 0 && start + u64::from(rec.size) > self.len {
            return Err(ImageError::corrupt(format!(
                "extent of {} ends past the end of the image",
                rec.name
            )));
        }
        Ok(start)
    }

    /// Reads the child records of a directory, skipping `.` and `..`.
    ///
    /// Records never cross a sector boundary; a zero length byte ends the
    /// records of the current sector.
    fn read_dir(&mut self, dir: &IsoRecord) -> Result<Vec<IsoRecord>> {
        if dir.size > MAX_DIR_LEN {
            return Err(ImageError::corrupt(format!(
                "directory {} claims {} bytes",
                dir.name, dir.size
            )));
        }
        let start = self.check_extent(dir)?;
        let size = dir.size as usize;
        let mut buf = vec![0u8; size];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut buf)?;

        let mut records = Vec::new();
        for sector in buf.chunks(SECTOR_SIZE as usize) {
            let mut pos = 0;
            while pos < sector.len() {
                let len = usize::from(sector[pos]);
                if len == 0 {
                    break;
                }
                if pos + len > sector.len() {
                    return Err(ImageError::corrupt(format!(
                        "directory record in {} crosses a sector boundary",
                        dir.name
                    )));
                }
                let rec = IsoRecord::decode(&sector[pos..pos + len])?;
                if !rec.is_special() {
                    records.push(rec);
                }
                pos += len;
            }
        }
        Ok(records)
    }

    /// Lists every file and directory in pre-order.
    pub(crate) fn list(&mut self, task: &mut Task<'_>) -> Result<Vec<Entry>> {
        task.check()?;
        let mut out = Vec::new();
        let mut visited = HashSet::from([self.root.extent]);
        let root = self.root.clone();
        let mut stack = vec![(String::new(), self.read_dir(&root)?.into_iter())];

        while let Some((prefix, children)) = stack.last_mut() {
            let Some(rec) = children.next() else {
                stack.pop();
                continue;
            };
            if out.len() >= MAX_ENTRIES {
                warn!(limit = MAX_ENTRIES, "ISO listing truncated at entry cap");
                break;
            }
            let path = join_entry_path(prefix, &rec.name);

            if !rec.is_dir {
                out.push(Entry::file(path, u64::from(rec.size), rec.recorded));
                continue;
            }
            out.push(Entry::directory(path.clone(), rec.recorded));
            if stack.len() >= MAX_DEPTH {
                warn!(%path, "not descending past the directory depth cap");
                continue;
            }
            if !visited.insert(rec.extent) {
                warn!(%path, extent = rec.extent, "skipping directory seen twice");
                continue;
            }
            task.check()?;
            let children = self.read_dir(&rec)?;
            stack.push((path, children.into_iter()));
        }
        Ok(out)
    }

    /// Extracts the whole image, or only the entry at the `/`-joined path
    /// `entry`, into `out_dir`.
    pub(crate) fn extract(
        &mut self,
        out_dir: &Path,
        entry: Option<&str>,
        task: &mut Task<'_>,
    ) -> Result<()> {
        fs::create_dir_all(out_dir)?;
        let target = match entry {
            Some(path) => self.resolve(path)?,
            None => self.root.clone(),
        };

        if !target.is_dir {
            return self.extract_file(&target, &safe_join(out_dir, &target.name)?, task);
        }
        let dest = if entry.is_some() && target.extent != self.root.extent {
            safe_join(out_dir, &target.name)?
        } else {
            out_dir.to_path_buf()
        };
        self.extract_dir(&target, &dest, task)
    }

    fn resolve(&mut self, path: &str) -> Result<IsoRecord> {
        let mut current = self.root.clone();
        for component in path_components(path) {
            if !current.is_dir {
                return Err(ImageError::NotFound(path.to_string()));
            }
            current = self
                .read_dir(&current)?
                .into_iter()
                .find(|r| r.name.eq_ignore_ascii_case(component))
                .ok_or_else(|| ImageError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    fn extract_dir(&mut self, dir: &IsoRecord, dest: &Path, task: &mut Task<'_>) -> Result<()> {
        let mut visited = HashSet::from([dir.extent]);
        let mut stack = vec![(dir.clone(), dest.to_path_buf(), 0usize)];
        let mut count = 0usize;

        while let Some((dir, dest, depth)) = stack.pop() {
            task.check()?;
            fs::create_dir_all(&dest)?;
            for rec in self.read_dir(&dir)? {
                count += 1;
                if count > MAX_ENTRIES {
                    warn!(limit = MAX_ENTRIES, "ISO extraction truncated at entry cap");
                    return Ok(());
                }
                let target = safe_join(&dest, &rec.name)?;
                if !rec.is_dir {
                    self.extract_file(&rec, &target, task)?;
                } else if depth + 1 < MAX_DEPTH && visited.insert(rec.extent) {
                    stack.push((rec, target, depth + 1));
                } else {
                    warn!(path = %target.display(), "not descending into directory");
                    fs::create_dir_all(&target)?;
                }
            }
        }
        Ok(())
    }

    fn extract_file(&mut self, rec: &IsoRecord, target: &Path, task: &mut Task<'_>) -> Result<()> {
        let start = self.check_extent(rec)?;
        let mut out = File::create(target)?;
        self.file.seek(SeekFrom::Start(start))?;
        let size = u64::from(rec.size);
        copy_exact(&mut (&self.file).take(size), size, &mut out, task)?;

        if let Some(mtime) = system_time(rec.recorded) {
            if let Err(err) = out.set_modified(mtime) {
                debug!(path = %target.display(), %err, "could not set modification time");
            }
        }
        Ok(())
    }
}
