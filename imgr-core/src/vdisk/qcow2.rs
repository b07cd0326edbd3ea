//! qcow2 (version 2 and 3) translation layer.
//!
//! Guest offsets are resolved one cluster at a time through the two-level
//! L1/L2 tables. The L1 table is loaded on open, L2 tables are loaded lazily
//! and kept in a small cache keyed by their host offset, and the most
//! recently touched data cluster is kept in memory so scattered small reads
//! inside one cluster do not walk the tables again.
//!
//! Snapshots, encryption, backing files, external data files and compressed
//! clusters are out of scope. Compressed clusters are detected per read and
//! fail with [`ImageError::Unsupported`].
use super::BlockDevice;
use crate::endian::{be_u32, be_u64, put_be_u16, put_be_u32, put_be_u64};
use crate::error::{ImageError, Result};
use crate::fat;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const QCOW2_MAGIC: [u8; 4] = *b"QFI\xfb";

const HEADER_V2_LEN: usize = 72;
const HEADER_V3_LEN: usize = 104;

const OFLAG_COPIED: u64 = 1 << 63;
const OFLAG_COMPRESSED: u64 = 1 << 62;
const OFLAG_ZERO: u64 = 1 << 0;
// Bits 9..=55 of L1, L2 and refcount table entries.
const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

const INCOMPAT_DIRTY: u64 = 1 << 0;
const INCOMPAT_CORRUPT: u64 = 1 << 1;

/// Number of L2 tables kept before the cache is cleared.
const L2_CACHE_LIMIT: usize = 64;
/// L1 entries fetched per read while loading the table.
const L1_READ_CHUNK: usize = 64 * 1024;

/// Cluster size used by [`create_qcow2`].
const CREATE_CLUSTER_BITS: u32 = 16;
/// Header, refcount table, refcount block, L1 table, L2 table, first data cluster.
const BOOTSTRAP_CLUSTERS: u64 = 6;

/// How a guest cluster is backed in the host file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterMapping {
    /// No L1 or L2 entry; reads as zeros.
    Unallocated,
    /// Explicit all-zero cluster (`OFLAG_ZERO`, version 3 only).
    Zero,
    /// Host offset of the cluster's first byte.
    Data(u64),
}

#[derive(Debug)]
struct Header {
    version: u32,
    cluster_bits: u32,
    size: u64,
    l1_size: u32,
    l1_table_offset: u64,
    refcount_table_offset: u64,
    refcount_table_clusters: u32,
    refcount_order: u32,
}

impl Header {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_V2_LEN || raw[..4] != QCOW2_MAGIC {
            return Err(ImageError::BadSignature("qcow2"));
        }

        let version = be_u32(raw, 4);
        if !(2..=3).contains(&version) {
            return Err(ImageError::Unsupported("qcow2 version other than 2 or 3"));
        }
        if be_u64(raw, 8) != 0 {
            return Err(ImageError::Unsupported("qcow2 backing files"));
        }
        let cluster_bits = be_u32(raw, 20);
        if !(9..=21).contains(&cluster_bits) {
            return Err(ImageError::corrupt(format!(
                "qcow2 cluster_bits {cluster_bits} out of range"
            )));
        }
        if be_u32(raw, 32) != 0 {
            return Err(ImageError::Unsupported("qcow2 encryption"));
        }

        let refcount_order = if version >= 3 {
            if raw.len() < HEADER_V3_LEN {
                return Err(ImageError::corrupt("truncated qcow2 v3 header"));
            }
            let incompatible = be_u64(raw, 72);
            if incompatible & INCOMPAT_CORRUPT != 0 {
                return Err(ImageError::corrupt("qcow2 image is marked corrupt"));
            }
            if incompatible & !(INCOMPAT_DIRTY | INCOMPAT_CORRUPT) != 0 {
                return Err(ImageError::Unsupported("qcow2 incompatible feature bits"));
            }
            be_u32(raw, 96)
        } else {
            4
        };

        let header = Self {
            version,
            cluster_bits,
            size: be_u64(raw, 24),
            l1_size: be_u32(raw, 36),
            l1_table_offset: be_u64(raw, 40),
            refcount_table_offset: be_u64(raw, 48),
            refcount_table_clusters: be_u32(raw, 56),
            refcount_order,
        };

        let cluster_mask = (1u64 << cluster_bits) - 1;
        if header.l1_table_offset & cluster_mask != 0
            || header.refcount_table_offset & cluster_mask != 0
        {
            return Err(ImageError::corrupt("qcow2 table offset not cluster aligned"));
        }
        Ok(header)
    }
}

/// A virtual disk backed by a qcow2 image.
#[derive(Debug)]
pub struct Qcow2Disk {
    file: File,
    header: Header,
    cluster_size: u64,
    l2_entries: u64,
    l1: Vec<u64>,
    l2_cache: HashMap<u64, Vec<u64>>,
    cluster_cache: Option<(u64, Vec<u8>)>,
    pos: u64,
    file_len: u64,
    writable: bool,
}

impl Qcow2Disk {
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let file_len = file.metadata()?.len();

        let mut raw = [0u8; HEADER_V3_LEN];
        let n = read_up_to(&mut file, 0, &mut raw)?;
        let header = Header::parse(&raw[..n])?;

        let cluster_size = 1u64 << header.cluster_bits;
        let l2_entries = cluster_size / 8;
        let l1 = load_l1(&mut file, &header, file_len, l2_entries)?;
        debug!(
            version = header.version,
            cluster_size,
            virtual_size = header.size,
            l1_entries = l1.len(),
            "opened qcow2 image"
        );

        Ok(Self {
            file,
            header,
            cluster_size,
            l2_entries,
            l1,
            l2_cache: HashMap::new(),
            cluster_cache: None,
            pos: 0,
            file_len,
            writable,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn length(&self) -> u64 {
        self.header.size
    }

    /// Resolves the cluster containing guest offset `vpos`.
    pub fn cluster_mapping(&mut self, vpos: u64) -> Result<ClusterMapping> {
        let cluster_index = vpos >> self.header.cluster_bits;
        let l1_index = cluster_index / self.l2_entries;
        let l2_index = (cluster_index % self.l2_entries) as usize;

        let l1_entry = usize::try_from(l1_index)
            .ok()
            .and_then(|i| self.l1.get(i).copied())
            .unwrap_or(0);
        let l2_offset = l1_entry & OFFSET_MASK;
        if l2_offset == 0 {
            return Ok(ClusterMapping::Unallocated);
        }

        let entry = self.l2_entry(l2_offset, l2_index)?;
        decode_l2_entry(entry, self.header.version)
    }

    /// Host file offset backing guest offset `vpos`, or `None` when the
    /// cluster reads as zeros.
    pub fn physical_offset(&mut self, vpos: u64) -> Result<Option<u64>> {
        Ok(match self.cluster_mapping(vpos)? {
            ClusterMapping::Data(base) => Some(base + (vpos & (self.cluster_size - 1))),
            ClusterMapping::Unallocated | ClusterMapping::Zero => None,
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() && self.pos < self.header.size {
            let base = self.pos & !(self.cluster_size - 1);
            let within = (self.pos - base) as usize;
            let limit = clamp_usize(self.header.size - self.pos);
            let data = self.load_cluster(base)?;

            let n = (buf.len() - done).min(data.len() - within).min(limit);
            buf[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(ImageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }

        let mut done = 0;
        while done < buf.len() {
            if self.pos >= self.header.size {
                return Err(ImageError::InvalidConfig(format!(
                    "write past end of virtual disk at offset {}",
                    self.pos
                )));
            }
            let base = self.pos & !(self.cluster_size - 1);
            let within = (self.pos - base) as usize;
            let n = (buf.len() - done)
                .min(self.cluster_size as usize - within)
                .min(clamp_usize(self.header.size - self.pos));

            let host = self.writable_cluster(base)?;
            self.file.seek(SeekFrom::Start(host + within as u64))?;
            self.file.write_all(&buf[done..done + n])?;
            if let Some((cached, data)) = &mut self.cluster_cache {
                if *cached == base {
                    data[within..within + n].copy_from_slice(&buf[done..done + n]);
                }
            }

            done += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn load_cluster(&mut self, base: u64) -> Result<&[u8]> {
        let hit = matches!(&self.cluster_cache, Some((cached, _)) if *cached == base);
        if !hit {
            let mut data = match self.cluster_cache.take() {
                Some((_, data)) => data,
                None => vec![0u8; self.cluster_size as usize],
            };
            data.fill(0);
            match self.cluster_mapping(base)? {
                ClusterMapping::Data(host) => {
                    read_up_to(&mut self.file, host, &mut data)?;
                }
                ClusterMapping::Unallocated | ClusterMapping::Zero => {}
            }
            self.cluster_cache = Some((base, data));
        }
        match &self.cluster_cache {
            Some((_, data)) => Ok(data),
            None => Err(ImageError::corrupt("qcow2 cluster cache unavailable")),
        }
    }

    fn l2_entry(&mut self, l2_offset: u64, index: usize) -> Result<u64> {
        if !self.l2_cache.contains_key(&l2_offset) {
            if self.l2_cache.len() >= L2_CACHE_LIMIT {
                self.l2_cache.clear();
            }
            let table = self.load_l2(l2_offset)?;
            self.l2_cache.insert(l2_offset, table);
        }
        self.l2_cache
            .get(&l2_offset)
            .and_then(|t| t.get(index).copied())
            .ok_or_else(|| ImageError::corrupt("qcow2 L2 index out of range"))
    }

    fn load_l2(&mut self, l2_offset: u64) -> Result<Vec<u64>> {
        if l2_offset
            .checked_add(self.cluster_size)
            .is_none_or(|end| end > self.file_len)
        {
            return Err(ImageError::corrupt(format!(
                "qcow2 L2 table at {l2_offset:#x} lies beyond end of file"
            )));
        }
        let mut raw = vec![0u8; self.cluster_size as usize];
        self.file.seek(SeekFrom::Start(l2_offset))?;
        self.file.read_exact(&mut raw)?;
        debug!(offset = l2_offset, "loaded qcow2 L2 table");
        Ok(raw.chunks_exact(8).map(|c| be_u64(c, 0)).collect())
    }

    /// Host offset of the cluster at guest offset `base`, allocating it
    /// (and its L2 table) when it is not yet backed by host storage.
    fn writable_cluster(&mut self, base: u64) -> Result<u64> {
        let cluster_index = base >> self.header.cluster_bits;
        let l1_index = usize::try_from(cluster_index / self.l2_entries)
            .ok()
            .filter(|&i| i < self.l1.len())
            .ok_or(ImageError::Unsupported("qcow2 writes beyond the L1 table"))?;
        let l2_index = (cluster_index % self.l2_entries) as usize;

        let l1_entry = self.l1[l1_index];
        let mut l2_offset = l1_entry & OFFSET_MASK;
        if l2_offset == 0 {
            l2_offset = self.allocate_cluster()?;
            let entry = l2_offset | OFLAG_COPIED;
            let slot = self.header.l1_table_offset + l1_index as u64 * 8;
            self.write_u64_at(slot, entry)?;
            self.l1[l1_index] = entry;
        } else if l1_entry & OFLAG_COPIED == 0 {
            return Err(ImageError::Unsupported("qcow2 writes to shared L2 tables"));
        }

        let entry = self.l2_entry(l2_offset, l2_index)?;
        if entry & OFLAG_COMPRESSED != 0 {
            return Err(ImageError::Unsupported("qcow2 compressed clusters"));
        }
        let zero = self.header.version >= 3 && entry & OFLAG_ZERO != 0;
        let host = entry & OFFSET_MASK;
        if host != 0 && entry & OFLAG_COPIED == 0 {
            return Err(ImageError::Unsupported("qcow2 writes to shared clusters"));
        }
        if host != 0 && !zero {
            return Ok(host);
        }

        let host = if host != 0 {
            // Preallocated zero cluster: scrub it and drop the flag.
            self.file.seek(SeekFrom::Start(host))?;
            self.file.write_all(&vec![0u8; self.cluster_size as usize])?;
            host
        } else {
            self.allocate_cluster()?
        };

        let entry = host | OFLAG_COPIED;
        self.write_u64_at(l2_offset + l2_index as u64 * 8, entry)?;
        if let Some(table) = self.l2_cache.get_mut(&l2_offset) {
            table[l2_index] = entry;
        }
        Ok(host)
    }

    /// Appends a zero-filled cluster to the host file and marks it in use.
    fn allocate_cluster(&mut self) -> Result<u64> {
        let offset = self.file_len.next_multiple_of(self.cluster_size);
        self.file_len = offset + self.cluster_size;
        self.file.set_len(self.file_len)?;
        self.set_refcount(offset, 1)?;
        debug!(offset, "allocated qcow2 cluster");
        Ok(offset)
    }

    fn set_refcount(&mut self, host: u64, value: u16) -> Result<()> {
        if self.header.refcount_order != 4 {
            return Err(ImageError::Unsupported("qcow2 refcount widths other than 16 bits"));
        }
        let per_block = self.cluster_size / 2;
        let cluster_index = host >> self.header.cluster_bits;
        let table_index = cluster_index / per_block;
        let table_len = u64::from(self.header.refcount_table_clusters) * self.cluster_size / 8;
        if table_index >= table_len {
            return Err(ImageError::Unsupported("qcow2 refcount table growth"));
        }

        let slot = self.header.refcount_table_offset + table_index * 8;
        let mut block = self.read_u64_at(slot)? & OFFSET_MASK;
        if block == 0 {
            block = self.file_len.next_multiple_of(self.cluster_size);
            self.file_len = block + self.cluster_size;
            self.file.set_len(self.file_len)?;
            self.write_u64_at(slot, block)?;
            self.set_refcount(block, 1)?;
        }

        let offset = block + (cluster_index % per_block) * 2;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn read_u64_at(&mut self, offset: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }

    fn write_u64_at(&mut self, offset: u64, value: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_be_bytes())?;
        Ok(())
    }
}

fn decode_l2_entry(entry: u64, version: u32) -> Result<ClusterMapping> {
    if entry & OFLAG_COMPRESSED != 0 {
        return Err(ImageError::Unsupported("qcow2 compressed clusters"));
    }
    if version >= 3 && entry & OFLAG_ZERO != 0 {
        return Ok(ClusterMapping::Zero);
    }
    match entry & OFFSET_MASK {
        0 => Ok(ClusterMapping::Unallocated),
        host => Ok(ClusterMapping::Data(host)),
    }
}

/// Loads the L1 table, bounded by what the virtual size can address and by
/// what the host file actually holds.
fn load_l1(file: &mut File, header: &Header, file_len: u64, l2_entries: u64) -> Result<Vec<u64>> {
    let cluster_size = 1u64 << header.cluster_bits;
    let addressable = header.size.div_ceil(cluster_size).div_ceil(l2_entries);
    let mut wanted = u64::from(header.l1_size).min(addressable);

    let available = file_len.saturating_sub(header.l1_table_offset) / 8;
    if wanted > available {
        warn!(
            declared = header.l1_size,
            available, "qcow2 L1 table runs past end of file; truncating"
        );
        wanted = available;
    }

    let mut l1 = Vec::new();
    let mut raw = vec![0u8; L1_READ_CHUNK.min(wanted as usize) * 8];
    let mut offset = header.l1_table_offset;
    while (l1.len() as u64) < wanted {
        let n = (wanted - l1.len() as u64).min(L1_READ_CHUNK as u64) as usize;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut raw[..n * 8])?;
        l1.extend(raw[..n * 8].chunks_exact(8).map(|c| be_u64(c, 0)));
        offset += n as u64 * 8;
    }
    Ok(l1)
}

/// Reads as much of `buf` as the file holds at `offset`, leaving the rest
/// untouched.
fn read_up_to(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut done = 0;
    while done < buf.len() {
        let n = file.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

fn clamp_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Creates a qcow2 image of `size_mb` MiB whose guest disk is a freshly
/// formatted FAT volume labelled `label`, and returns it opened for writing.
///
/// The container starts with six clusters in fixed roles: header, refcount
/// table, refcount block, L1 table, L2 table and the first data cluster,
/// which backs guest cluster 0 (the boot sector). Anything else the
/// formatter touches is allocated through the regular write path.
pub fn create_qcow2(path: &Path, size_mb: u64, label: &str) -> Result<BlockDevice> {
    let cluster_size = 1u64 << CREATE_CLUSTER_BITS;
    let size = size_mb
        .checked_mul(1024 * 1024)
        .filter(|&s| s > 0)
        .ok_or_else(|| ImageError::InvalidConfig(format!("invalid disk size {size_mb} MiB")))?;

    let l2_entries = cluster_size / 8;
    let l1_size = size.div_ceil(cluster_size).div_ceil(l2_entries);
    if l1_size * 8 > cluster_size {
        return Err(ImageError::InvalidConfig(format!(
            "disk size {size_mb} MiB needs more than one L1 cluster"
        )));
    }

    let refcount_table_offset = cluster_size;
    let refcount_block_offset = cluster_size * 2;
    let l1_table_offset = cluster_size * 3;
    let l2_table_offset = cluster_size * 4;
    let data_offset = cluster_size * 5;

    let mut image = vec![0u8; (cluster_size * BOOTSTRAP_CLUSTERS) as usize];
    image[..4].copy_from_slice(&QCOW2_MAGIC);
    put_be_u32(&mut image, 4, 3); // version
    put_be_u32(&mut image, 20, CREATE_CLUSTER_BITS);
    put_be_u64(&mut image, 24, size);
    put_be_u32(&mut image, 36, l1_size as u32);
    put_be_u64(&mut image, 40, l1_table_offset);
    put_be_u64(&mut image, 48, refcount_table_offset);
    put_be_u32(&mut image, 56, 1); // refcount_table_clusters
    put_be_u32(&mut image, 96, 4); // refcount_order (16-bit)
    put_be_u32(&mut image, 100, HEADER_V3_LEN as u32);

    put_be_u64(&mut image, refcount_table_offset as usize, refcount_block_offset);
    for cluster in 0..BOOTSTRAP_CLUSTERS {
        put_be_u16(&mut image, (refcount_block_offset + cluster * 2) as usize, 1);
    }
    put_be_u64(&mut image, l1_table_offset as usize, l2_table_offset | OFLAG_COPIED);
    put_be_u64(&mut image, l2_table_offset as usize, data_offset | OFLAG_COPIED);

    fs::write(path, &image)?;

    let mut dev = BlockDevice::Qcow2(Qcow2Disk::open(path, true)?);
    fat::format(&mut dev, label)?;
    Ok(dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_flags_are_checked_before_the_offset() {
        assert_eq!(
            decode_l2_entry(0x5_0000 | OFLAG_COPIED | OFLAG_ZERO, 3).unwrap(),
            ClusterMapping::Zero
        );
        // Bit 0 is reserved in version 2 images.
        assert_eq!(
            decode_l2_entry(0x5_0000 | OFLAG_COPIED | OFLAG_ZERO, 2).unwrap(),
            ClusterMapping::Data(0x5_0000)
        );
        assert!(decode_l2_entry(0x5_0000 | OFLAG_COMPRESSED, 3)
            .unwrap_err()
            .is_unsupported());
        assert_eq!(decode_l2_entry(0, 3).unwrap(), ClusterMapping::Unallocated);
    }

    #[test]
    fn header_rejects_out_of_scope_features() {
        let mut raw = [0u8; HEADER_V3_LEN];
        raw[..4].copy_from_slice(&QCOW2_MAGIC);
        put_be_u32(&mut raw, 4, 3);
        put_be_u32(&mut raw, 20, 16);
        assert!(Header::parse(&raw).is_ok());

        let mut encrypted = raw;
        put_be_u32(&mut encrypted, 32, 1);
        assert!(Header::parse(&encrypted).unwrap_err().is_unsupported());

        let mut backed = raw;
        put_be_u64(&mut backed, 8, 512);
        assert!(Header::parse(&backed).unwrap_err().is_unsupported());

        let mut external = raw;
        put_be_u64(&mut external, 72, 1 << 2);
        assert!(Header::parse(&external).unwrap_err().is_unsupported());

        let mut bad = raw;
        bad[0] = b'X';
        assert!(matches!(
            Header::parse(&bad),
            Err(ImageError::BadSignature(_))
        ));
    }
}
