//! FAT12/16/32 file system driver.
//!
//! A [`FatVolume`] owns a [`BlockDevice`] and interprets it as a FAT volume,
//! so the same code serves raw `.img` files and qcow2-backed disks. Only
//! 8.3 short names are read and written; long-name fragments are skipped.
mod boot;
mod dir;
mod table;

pub use self::boot::{FatGeometry, FatType, SECTOR_SIZE, format, label_bytes};

use self::dir::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, DIR_ENTRY_SIZE, DOTDOT_NAME, DOT_NAME, DirEntry, Slot,
    encode_entry, parse_slot, short_name,
};
use crate::entry::Entry;
use crate::error::{ImageError, Result};
use crate::task::Task;
use crate::util::{
    host_mtime, is_same_file, join_entry_path, path_components, safe_join, system_time,
};
use crate::vdisk::BlockDevice;
use crate::{MAX_DEPTH, MAX_ENTRIES};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Where a directory's 32-byte slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DirLocation {
    /// The fixed-size FAT12/16 root directory area.
    FixedRoot,
    /// A cluster chain starting at the given cluster.
    Chain(u32),
}

pub struct FatVolume {
    dev: BlockDevice,
    geo: FatGeometry,
    /// Two sectors of the first FAT, so FAT12 entries that straddle a
    /// sector boundary decode from one buffer.
    fat_window: Option<(u64, Vec<u8>)>,
    next_free: u32,
}

impl FatVolume {
    /// Reads the boot sector of `dev` and derives the volume geometry.
    pub fn open(mut dev: BlockDevice) -> Result<Self> {
        if dev.length() < u64::from(SECTOR_SIZE) {
            return Err(ImageError::BadSignature("FAT"));
        }
        let mut bpb = [0u8; SECTOR_SIZE as usize];
        dev.read_exact_at(0, &mut bpb)?;
        let geo = FatGeometry::parse(&bpb)?;

        let declared = u64::from(geo.total_sector_count) * u64::from(geo.bytes_per_sector);
        if declared > dev.length() {
            warn!(
                declared,
                actual = dev.length(),
                "FAT volume is larger than its backing device"
            );
        }
        debug!(
            fat_type = geo.fat_type.name(),
            clusters = geo.cluster_count(),
            cluster_size = geo.cluster_size(),
            "opened FAT volume"
        );

        Ok(Self {
            dev,
            geo,
            fat_window: None,
            next_free: 2,
        })
    }

    pub fn geometry(&self) -> &FatGeometry {
        &self.geo
    }

    /// Flushes pending writes and hands back the underlying device.
    pub fn into_device(mut self) -> Result<BlockDevice> {
        self.dev.flush()?;
        Ok(self.dev)
    }

    pub fn close(self) -> Result<()> {
        self.into_device()?.close()
    }

    fn root(&self) -> DirLocation {
        match self.geo.fat_type {
            FatType::Fat32 => DirLocation::Chain(self.geo.root_cluster),
            FatType::Fat12 | FatType::Fat16 => DirLocation::FixedRoot,
        }
    }

    /// Loads the FAT window holding `cluster`'s entry and returns it with the
    /// entry's position inside it.
    fn fat_window(&mut self, cluster: u32) -> Result<(&mut [u8], usize)> {
        let fat_type = self.geo.fat_type;
        let offset = table::entry_offset(cluster, fat_type);
        let width = table::entry_width(fat_type) as u64;
        if cluster > self.geo.max_cluster() || offset + width > self.geo.fat_size() {
            return Err(ImageError::corrupt(format!(
                "cluster {cluster} is outside the allocation table"
            )));
        }

        let sector = u64::from(self.geo.bytes_per_sector);
        let start = offset / sector * sector;
        let window = match self.fat_window.take() {
            Some((cached, buf)) if cached == start => buf,
            _ => {
                let len = (2 * sector).min(self.geo.fat_size() - start);
                let mut buf = vec![0u8; len as usize];
                self.dev
                    .read_exact_at(self.geo.fat_area_start() + start, &mut buf)?;
                buf
            }
        };
        let (_, buf) = self.fat_window.insert((start, window));
        Ok((buf.as_mut_slice(), (offset - start) as usize))
    }

    fn fat_entry(&mut self, cluster: u32) -> Result<u32> {
        let fat_type = self.geo.fat_type;
        let (buf, pos) = self.fat_window(cluster)?;
        Ok(table::decode(buf, pos, cluster, fat_type))
    }

    /// Updates `cluster`'s entry in every FAT copy.
    fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<()> {
        let fat_type = self.geo.fat_type;
        let offset = table::entry_offset(cluster, fat_type);
        let width = table::entry_width(fat_type);
        let (buf, pos) = self.fat_window(cluster)?;
        table::encode(buf, pos, cluster, value, fat_type);
        let bytes = buf[pos..pos + width].to_vec();

        for copy in 0..u64::from(self.geo.fat_count) {
            let at = self.geo.fat_area_start() + copy * self.geo.fat_size() + offset;
            self.dev.write_all_at(at, &bytes)?;
        }
        Ok(())
    }

    /// Follows the chain starting at `start`.
    ///
    /// Stops at an end-of-chain value or a free/reserved (<2) link. A chain
    /// that revisits a cluster or points past the last cluster is corrupt.
    fn cluster_chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let end = self.geo.fat_type.end_of_chain();
        let bad = self.geo.fat_type.bad_cluster();
        let max = self.geo.max_cluster();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cluster = start;

        while cluster >= 2 && cluster < end {
            if cluster == bad {
                return Err(ImageError::corrupt(format!(
                    "cluster chain from {start} runs into a bad cluster"
                )));
            }
            if cluster > max {
                return Err(ImageError::corrupt(format!(
                    "cluster chain from {start} reaches invalid cluster {cluster:#x}"
                )));
            }
            if !seen.insert(cluster) {
                return Err(ImageError::corrupt(format!(
                    "cluster chain from {start} loops back to cluster {cluster}"
                )));
            }
            chain.push(cluster);
            cluster = self.fat_entry(cluster)?;
        }
        Ok(chain)
    }

    /// Byte ranges (offset, length) holding a directory's slots.
    fn dir_regions(&mut self, dir: DirLocation) -> Result<Vec<(u64, u64)>> {
        match dir {
            DirLocation::FixedRoot => {
                Ok(vec![(self.geo.root_dir_start(), self.geo.root_dir_size())])
            }
            DirLocation::Chain(first) => {
                let size = self.geo.cluster_size();
                Ok(self
                    .cluster_chain(first)?
                    .into_iter()
                    .map(|c| (self.geo.cluster_offset(c), size))
                    .collect())
            }
        }
    }

    /// Feeds every slot of `dir` to `visit` until it breaks or the end
    /// marker is reached.
    fn scan_dir(
        &mut self,
        dir: DirLocation,
        mut visit: impl FnMut(u64, Slot) -> ControlFlow<()>,
    ) -> Result<()> {
        let fat_type = self.geo.fat_type;
        for (start, len) in self.dir_regions(dir)? {
            let mut buf = vec![0u8; len as usize];
            self.dev.read_exact_at(start, &mut buf)?;
            for (i, raw) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                let slot = parse_slot(raw, fat_type);
                let end = matches!(slot, Slot::End);
                if visit(start + (i * DIR_ENTRY_SIZE) as u64, slot).is_break() || end {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn read_dir(&mut self, dir: DirLocation) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        self.scan_dir(dir, |_, slot| {
            if let Slot::Entry(e) = slot {
                entries.push(e);
            }
            ControlFlow::Continue(())
        })?;
        debug!(?dir, entries = entries.len(), "scanned FAT directory");
        Ok(entries)
    }

    /// Lists every file and directory on the volume in pre-order.
    ///
    /// Collection stops after [`MAX_ENTRIES`] entries and does not descend
    /// more than [`MAX_DEPTH`] levels.
    pub(crate) fn list(&mut self, task: &mut Task<'_>) -> Result<Vec<Entry>> {
        task.check()?;
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let root = self.read_dir(self.root())?;
        let mut stack = vec![(String::new(), root.into_iter())];

        while let Some((prefix, children)) = stack.last_mut() {
            let Some(e) = children.next() else {
                stack.pop();
                continue;
            };
            if out.len() >= MAX_ENTRIES {
                warn!(limit = MAX_ENTRIES, "FAT listing truncated at entry cap");
                break;
            }
            let path = join_entry_path(prefix, &e.name);

            if !e.is_dir() {
                out.push(Entry::file(path, u64::from(e.size), e.modified));
                continue;
            }
            out.push(Entry::directory(path.clone(), e.modified));
            if stack.len() >= MAX_DEPTH {
                warn!(%path, "not descending past the directory depth cap");
                continue;
            }
            if e.first_cluster < 2 || !visited.insert(e.first_cluster) {
                warn!(
                    %path,
                    cluster = e.first_cluster,
                    "skipping directory with invalid or repeated cluster"
                );
                continue;
            }
            task.check()?;
            let children = self.read_dir(DirLocation::Chain(e.first_cluster))?;
            stack.push((path, children.into_iter()));
        }
        Ok(out)
    }

    /// Extracts the whole volume, or only the entry at `entry` (a
    /// `/`-delimited path matched case-insensitively), into `out_dir`.
    pub(crate) fn extract(
        &mut self,
        out_dir: &Path,
        entry: Option<&str>,
        task: &mut Task<'_>,
    ) -> Result<()> {
        fs::create_dir_all(out_dir)?;
        let target = match entry {
            Some(path) => self.resolve(path)?,
            None => None,
        };

        match target {
            None => self.extract_dir(self.root(), out_dir, task),
            Some(e) if e.is_dir() => {
                let dest = safe_join(out_dir, &e.name)?;
                self.extract_dir(DirLocation::Chain(e.first_cluster), &dest, task)
            }
            Some(e) => self.extract_file(&e, &safe_join(out_dir, &e.name)?, task),
        }
    }

    /// Resolves a path to its directory entry; `None` means the root.
    fn resolve(&mut self, path: &str) -> Result<Option<DirEntry>> {
        let not_found = || ImageError::NotFound(path.to_string());
        let mut dir = self.root();
        let mut found: Option<DirEntry> = None;

        for component in path_components(path) {
            if let Some(parent) = &found {
                if !parent.is_dir() || parent.first_cluster < 2 {
                    return Err(not_found());
                }
                dir = DirLocation::Chain(parent.first_cluster);
            }
            let hit = self
                .read_dir(dir)?
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component))
                .ok_or_else(not_found)?;
            found = Some(hit);
        }
        Ok(found)
    }

    fn extract_dir(&mut self, dir: DirLocation, dest: &Path, task: &mut Task<'_>) -> Result<()> {
        let mut visited = HashSet::new();
        let mut stack = vec![(dir, dest.to_path_buf(), 0usize)];
        let mut count = 0usize;

        while let Some((dir, dest, depth)) = stack.pop() {
            task.check()?;
            fs::create_dir_all(&dest)?;
            for e in self.read_dir(dir)? {
                count += 1;
                if count > MAX_ENTRIES {
                    warn!(limit = MAX_ENTRIES, "FAT extraction truncated at entry cap");
                    return Ok(());
                }
                let target = safe_join(&dest, &e.name)?;
                if !e.is_dir() {
                    self.extract_file(&e, &target, task)?;
                } else if depth + 1 < MAX_DEPTH
                    && e.first_cluster >= 2
                    && visited.insert(e.first_cluster)
                {
                    stack.push((DirLocation::Chain(e.first_cluster), target, depth + 1));
                } else {
                    warn!(path = %target.display(), "not descending into directory");
                    fs::create_dir_all(&target)?;
                }
            }
        }
        Ok(())
    }

    fn extract_file(&mut self, e: &DirEntry, target: &Path, task: &mut Task<'_>) -> Result<()> {
        let mut out = File::create(target)?;
        let mut remaining = u64::from(e.size);

        if remaining > 0 {
            let chain = self.cluster_chain(e.first_cluster)?;
            let cluster_size = self.geo.cluster_size();
            if chain.len() as u64 * cluster_size < remaining {
                return Err(ImageError::corrupt(format!(
                    "cluster chain of {} is shorter than its {remaining} bytes",
                    e.name
                )));
            }

            let mut buf = vec![0u8; cluster_size as usize];
            for cluster in chain {
                if remaining == 0 {
                    break;
                }
                task.check()?;
                let n = remaining.min(cluster_size) as usize;
                self.dev
                    .read_exact_at(self.geo.cluster_offset(cluster), &mut buf[..n])?;
                out.write_all(&buf[..n])?;
                remaining -= n as u64;
                task.advance(n as u64);
            }
        }

        if let Some(mtime) = system_time(e.modified) {
            if let Err(err) = out.set_modified(mtime) {
                debug!(path = %target.display(), %err, "could not set modification time");
            }
        }
        Ok(())
    }

    /// Copies the host tree under `source` into the root directory, leaving
    /// out `output` (the image being written) if it lies inside the tree.
    pub(crate) fn import_tree(
        &mut self,
        source: &Path,
        output: &Path,
        task: &mut Task<'_>,
    ) -> Result<()> {
        let mut dirs = HashMap::from([(source.to_path_buf(), self.root())]);
        let mut taken: HashMap<DirLocation, HashSet<[u8; 11]>> = HashMap::new();
        let mut files = 0usize;

        for item in WalkDir::new(source)
            .min_depth(1)
            .max_depth(MAX_DEPTH)
            .sort_by_file_name()
        {
            task.check()?;
            let item = item.map_err(|e| ImageError::Io(e.into()))?;
            if is_same_file(item.path(), output) {
                continue;
            }
            let Some(&parent) = item.path().parent().and_then(|p| dirs.get(p)) else {
                continue;
            };

            let names = match taken.entry(parent) {
                MapEntry::Occupied(o) => o.into_mut(),
                MapEntry::Vacant(v) => {
                    v.insert(self.read_dir(parent)?.into_iter().map(|e| e.short).collect())
                }
            };
            let host_name = item.file_name().to_string_lossy();
            let short = short_name(&host_name, names);
            names.insert(short);

            let meta = item.metadata().map_err(|e| ImageError::Io(e.into()))?;
            if item.file_type().is_dir() {
                if item.depth() == MAX_DEPTH {
                    warn!(
                        path = %item.path().display(),
                        "not importing past the directory depth cap"
                    );
                }
                let created = self.create_dir(parent, &short, host_mtime(&meta))?;
                dirs.insert(item.path().to_path_buf(), created);
            } else if item.file_type().is_file() {
                self.create_file(parent, item.path(), &short, &meta, task)?;
                files += 1;
            } else {
                debug!(path = %item.path().display(), "skipping non-regular file");
            }
        }

        self.dev.flush()?;
        info!(files, source = %source.display(), "imported host tree into FAT volume");
        Ok(())
    }

    fn create_file(
        &mut self,
        dir: DirLocation,
        host_path: &Path,
        short: &[u8; 11],
        meta: &fs::Metadata,
        task: &mut Task<'_>,
    ) -> Result<()> {
        let size = u32::try_from(meta.len()).map_err(|_| {
            ImageError::InvalidConfig(format!(
                "{} is larger than the 4 GiB FAT file limit",
                host_path.display()
            ))
        })?;
        let cluster_size = self.geo.cluster_size();
        let chain = self.allocate_chain(u64::from(size).div_ceil(cluster_size))?;

        let mut src = File::open(host_path)?;
        let mut buf = vec![0u8; cluster_size as usize];
        let mut remaining = u64::from(size);
        for &cluster in &chain {
            task.check()?;
            let n = remaining.min(cluster_size) as usize;
            src.read_exact(&mut buf[..n])?;
            self.dev
                .write_all_at(self.geo.cluster_offset(cluster), &buf[..n])?;
            remaining -= n as u64;
            task.advance(n as u64);
        }

        let first = chain.first().copied().unwrap_or(0);
        let raw = encode_entry(short, ATTR_ARCHIVE, first, size, host_mtime(meta));
        self.add_dir_entry(dir, &raw)
    }

    fn create_dir(
        &mut self,
        parent: DirLocation,
        short: &[u8; 11],
        mtime: OffsetDateTime,
    ) -> Result<DirLocation> {
        let cluster = self.allocate_chain(1)?[0];
        self.zero_cluster(cluster)?;

        // `..` pointing at the root is stored as cluster 0, on FAT32 too.
        let parent_cluster = match parent {
            DirLocation::Chain(c) if c != self.geo.root_cluster => c,
            _ => 0,
        };
        let offset = self.geo.cluster_offset(cluster);
        let dot = encode_entry(&DOT_NAME, ATTR_DIRECTORY, cluster, 0, mtime);
        let dotdot = encode_entry(&DOTDOT_NAME, ATTR_DIRECTORY, parent_cluster, 0, mtime);
        self.dev.write_all_at(offset, &dot)?;
        self.dev.write_all_at(offset + DIR_ENTRY_SIZE as u64, &dotdot)?;

        let raw = encode_entry(short, ATTR_DIRECTORY, cluster, 0, mtime);
        self.add_dir_entry(parent, &raw)?;
        Ok(DirLocation::Chain(cluster))
    }

    /// Stores `raw` in the first free slot of `dir`, growing a chained
    /// directory by one cluster when it is full.
    fn add_dir_entry(&mut self, dir: DirLocation, raw: &[u8; DIR_ENTRY_SIZE]) -> Result<()> {
        let mut free = None;
        self.scan_dir(dir, |offset, slot| match slot {
            Slot::End | Slot::Free => {
                free = Some(offset);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        })?;

        if let Some(offset) = free {
            return self.dev.write_all_at(offset, raw);
        }

        match dir {
            DirLocation::FixedRoot => Err(ImageError::NoSpace),
            DirLocation::Chain(first) => {
                let last = self.cluster_chain(first)?.last().copied().unwrap_or(first);
                let grown = self.allocate_chain(1)?[0];
                self.zero_cluster(grown)?;
                self.set_fat_entry(last, grown)?;
                self.dev.write_all_at(self.geo.cluster_offset(grown), raw)
            }
        }
    }

    /// Allocates and links `count` free clusters, returning them in order.
    fn allocate_chain(&mut self, count: u64) -> Result<Vec<u32>> {
        let marker = self.geo.fat_type.end_of_chain_marker();
        let mut chain: Vec<u32> = Vec::new();
        for _ in 0..count {
            let cluster = self.find_free()?;
            self.set_fat_entry(cluster, marker)?;
            if let Some(&prev) = chain.last() {
                self.set_fat_entry(prev, cluster)?;
            }
            chain.push(cluster);
            self.next_free = cluster + 1;
        }
        Ok(chain)
    }

    /// First-fit search for a free cluster starting at the allocation hint.
    fn find_free(&mut self) -> Result<u32> {
        let max = self.geo.max_cluster();
        let start = if (2..=max).contains(&self.next_free) {
            self.next_free
        } else {
            2
        };
        for cluster in (start..=max).chain(2..start) {
            if self.fat_entry(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        Err(ImageError::NoSpace)
    }

    fn zero_cluster(&mut self, cluster: u32) -> Result<()> {
        let zeros = vec![0u8; self.geo.cluster_size() as usize];
        self.dev.write_all_at(self.geo.cluster_offset(cluster), &zeros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::detached;
    use tempfile::TempDir;

    fn fresh_volume(dir: &TempDir, mb: u64) -> FatVolume {
        let path = dir.path().join("vol.img");
        File::create(&path).unwrap().set_len(mb * 1024 * 1024).unwrap();
        let mut dev = BlockDevice::open(&path, true).unwrap();
        format(&mut dev, "UNIT").unwrap();
        FatVolume::open(dev).unwrap()
    }

    #[test]
    fn allocation_links_clusters_and_mirrors_fats() {
        let tmp = TempDir::new().unwrap();
        let mut vol = fresh_volume(&tmp, 4);
        let chain = vol.allocate_chain(3).unwrap();
        assert_eq!(chain, vec![2, 3, 4]);
        assert_eq!(vol.cluster_chain(2).unwrap(), chain);

        let geo = vol.geometry().clone();
        let mut fat0 = vec![0u8; 16];
        let mut fat1 = vec![0u8; 16];
        vol.dev.read_exact_at(geo.fat_area_start(), &mut fat0).unwrap();
        vol.dev
            .read_exact_at(geo.fat_area_start() + geo.fat_size(), &mut fat1)
            .unwrap();
        assert_eq!(fat0, fat1);
    }

    #[test]
    fn looping_chain_is_reported_as_corrupt() {
        let tmp = TempDir::new().unwrap();
        let mut vol = fresh_volume(&tmp, 4);
        vol.allocate_chain(3).unwrap();
        vol.set_fat_entry(4, 2).unwrap();
        let err = vol.cluster_chain(2).unwrap_err();
        assert!(matches!(err, ImageError::Corrupt(_)), "{err}");
    }

    #[test]
    fn bad_cluster_marker_ends_the_walk_as_corrupt() {
        let tmp = TempDir::new().unwrap();
        let mut vol = fresh_volume(&tmp, 4);
        vol.allocate_chain(2).unwrap();
        let bad = vol.geometry().fat_type.bad_cluster();
        vol.set_fat_entry(3, bad).unwrap();
        let err = vol.cluster_chain(2).unwrap_err();
        assert!(matches!(err, ImageError::Corrupt(_)), "{err}");
        assert!(err.to_string().contains("bad cluster"), "{err}");
    }

    #[test]
    fn chain_stops_at_free_link() {
        let tmp = TempDir::new().unwrap();
        let mut vol = fresh_volume(&tmp, 4);
        vol.allocate_chain(2).unwrap();
        vol.set_fat_entry(3, 0).unwrap();
        assert_eq!(vol.cluster_chain(2).unwrap(), vec![2, 3]);
        assert!(vol.cluster_chain(0).unwrap().is_empty());
    }

    #[test]
    fn fixed_root_reports_no_space_when_full() {
        let tmp = TempDir::new().unwrap();
        let mut vol = fresh_volume(&tmp, 1);
        let raw = encode_entry(b"FILLER  BIN", ATTR_ARCHIVE, 0, 0, OffsetDateTime::UNIX_EPOCH);
        // One slot is taken by the volume label.
        for _ in 1..vol.geometry().root_entry_count {
            vol.add_dir_entry(DirLocation::FixedRoot, &raw).unwrap();
        }
        assert!(matches!(
            vol.add_dir_entry(DirLocation::FixedRoot, &raw),
            Err(ImageError::NoSpace)
        ));
    }

    #[test]
    fn subdirectories_grow_past_one_cluster() {
        let tmp = TempDir::new().unwrap();
        let mut vol = fresh_volume(&tmp, 4);
        let sub = vol
            .create_dir(DirLocation::FixedRoot, b"SUB        ", OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let per_cluster = vol.geometry().cluster_size() as usize / DIR_ENTRY_SIZE;
        let mut taken = HashSet::new();
        for i in 0..per_cluster {
            let name = short_name(&format!("f{i}.txt"), &taken);
            taken.insert(name);
            let raw = encode_entry(&name, ATTR_ARCHIVE, 0, 0, OffsetDateTime::UNIX_EPOCH);
            vol.add_dir_entry(sub, &raw).unwrap();
        }

        let DirLocation::Chain(first) = sub else {
            panic!("subdirectory must be chained");
        };
        assert_eq!(vol.cluster_chain(first).unwrap().len(), 2);
        assert_eq!(vol.read_dir(sub).unwrap().len(), per_cluster);
    }

    #[test]
    fn import_then_list_and_extract() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("docs")).unwrap();
        fs::write(src.join("hello.txt"), b"hello fat").unwrap();
        fs::write(src.join("docs/notes.md"), vec![7u8; 5000]).unwrap();

        let mut vol = fresh_volume(&tmp, 4);
        let image = tmp.path().join("vol.img");
        detached(|task| vol.import_tree(&src, &image, task)).unwrap();

        let listed = detached(|task| vol.list(task)).unwrap();
        let listed: Vec<_> = listed.into_iter().map(|e| e.path).collect();
        assert_eq!(listed, vec!["DOCS", "DOCS/NOTES.MD", "HELLO.TXT"]);

        let out = tmp.path().join("out");
        detached(|task| vol.extract(&out, Some("docs/notes.md"), task)).unwrap();
        assert_eq!(fs::read(out.join("NOTES.MD")).unwrap(), vec![7u8; 5000]);
        assert!(!out.join("HELLO.TXT").exists());
    }
}
