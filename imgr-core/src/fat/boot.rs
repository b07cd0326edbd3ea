//! BIOS Parameter Block parsing, geometry planning and volume formatting.
use super::dir::{ATTR_VOLUME_ID, encode_entry};
use super::table;
use crate::endian::{le_u16, le_u32, put_le_u16, put_le_u32};
use crate::error::{ImageError, Result};
use crate::vdisk::BlockDevice;
use time::OffsetDateTime;
use tracing::info;

pub const SECTOR_SIZE: u32 = 512;

/// Volumes at or above this many sectors are formatted as FAT32.
const FAT32_THRESHOLD: u32 = 1_048_576;
const MIN_SECTORS: u32 = 128;
const MAX_CLUSTER_SIZE: u64 = 64 * 1024;
const FAT12_MAX_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65525;
const MEDIA_FIXED_DISK: u8 = 0xF8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < FAT12_MAX_CLUSTERS {
            FatType::Fat12
        } else if clusters < FAT16_MAX_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }

    /// Smallest FAT entry value that ends a cluster chain.
    pub fn end_of_chain(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// The all-ones end-of-chain value written when terminating a chain.
    pub fn end_of_chain_marker(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// FAT entry value marking a cluster as unusable.
    pub fn bad_cluster(self) -> u32 {
        self.end_of_chain() - 1
    }

    fn fs_type_label(self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

/// Volume layout derived from the boot sector. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sector_count: u32,
    pub fat_count: u32,
    /// Fixed root directory entries; 0 for FAT32.
    pub root_entry_count: u32,
    pub sectors_per_fat: u32,
    pub total_sector_count: u32,
    /// First cluster of the root directory (FAT32 only).
    pub root_cluster: u32,
    pub media: u8,
    pub fat_type: FatType,
}

impl FatGeometry {
    /// Parses and validates a 512-byte boot sector.
    pub fn parse(bpb: &[u8]) -> Result<Self> {
        if bpb.len() < 512 || bpb[510] != 0x55 || bpb[511] != 0xAA {
            return Err(ImageError::BadSignature("FAT"));
        }
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(ImageError::corrupt("invalid FAT boot sector: bad jump instruction"));
        }

        let bytes_per_sector = u32::from(le_u16(bpb, 11));
        if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
            return Err(ImageError::corrupt(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }
        let sectors_per_cluster = u32::from(bpb[13]);
        if !sectors_per_cluster.is_power_of_two() {
            return Err(ImageError::corrupt(format!(
                "invalid sectors per cluster: {sectors_per_cluster}"
            )));
        }
        if u64::from(bytes_per_sector * sectors_per_cluster) > MAX_CLUSTER_SIZE {
            return Err(ImageError::corrupt("cluster size exceeds 64 KiB"));
        }

        let reserved_sector_count = u32::from(le_u16(bpb, 14));
        let fat_count = u32::from(bpb[16]);
        let root_entry_count = u32::from(le_u16(bpb, 17));
        if reserved_sector_count == 0 || fat_count == 0 {
            return Err(ImageError::corrupt("boot sector declares no reserved sectors or FATs"));
        }

        let total_16 = u32::from(le_u16(bpb, 19));
        let total_sector_count = if total_16 != 0 {
            total_16
        } else {
            le_u32(bpb, 32)
        };
        let fat_size_16 = u32::from(le_u16(bpb, 22));
        let sectors_per_fat = if fat_size_16 != 0 {
            fat_size_16
        } else {
            le_u32(bpb, 36)
        };
        if sectors_per_fat == 0 {
            return Err(ImageError::corrupt("boot sector declares an empty FAT"));
        }

        let mut geo = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            fat_count,
            root_entry_count,
            sectors_per_fat,
            total_sector_count,
            root_cluster: 0,
            media: bpb[21],
            fat_type: FatType::Fat12,
        };

        let data_start = u64::from(geo.data_start_sector());
        if data_start >= u64::from(total_sector_count) {
            return Err(ImageError::corrupt("FAT data area starts past end of volume"));
        }

        // A BPB without a 16-bit FAT size or fixed root is laid out as FAT32
        // even when the cluster count alone would say otherwise.
        geo.fat_type = if fat_size_16 == 0 && root_entry_count == 0 {
            FatType::Fat32
        } else {
            FatType::from_cluster_count(geo.cluster_count())
        };
        if geo.fat_type == FatType::Fat32 {
            geo.root_cluster = le_u32(bpb, 44) & 0x0FFF_FFFF;
            if geo.root_cluster < 2 {
                return Err(ImageError::corrupt("invalid FAT32 root cluster"));
            }
        }
        Ok(geo)
    }

    /// Picks a layout for a fresh volume of `total_sectors` 512-byte sectors.
    pub fn plan(total_sectors: u32) -> Result<Self> {
        if total_sectors < MIN_SECTORS {
            return Err(ImageError::InvalidConfig(format!(
                "volume of {total_sectors} sectors is too small for FAT"
            )));
        }

        let mut spc = match total_sectors {
            n if n < 2048 => 1,
            n if n < 8192 => 2,
            n if n < 32768 => 4,
            n if n < 262_144 => 8,
            n if n < FAT32_THRESHOLD => 16,
            _ => 32,
        };

        if total_sectors >= FAT32_THRESHOLD {
            return Ok(Self::layout(total_sectors, spc, FatType::Fat32));
        }

        loop {
            let fat12 = Self::layout(total_sectors, spc, FatType::Fat12);
            if fat12.cluster_count() < FAT12_MAX_CLUSTERS {
                return Ok(fat12);
            }
            let mut fat16 = Self::layout(total_sectors, spc, FatType::Fat16);
            let clusters = fat16.cluster_count();
            if clusters < FAT12_MAX_CLUSTERS {
                // The wider table pushed the count back under the FAT12
                // limit; keep its size and pack 12-bit entries into it.
                fat16.fat_type = FatType::Fat12;
                return Ok(fat16);
            }
            if clusters < FAT16_MAX_CLUSTERS {
                return Ok(fat16);
            }
            if spc >= 128 {
                return Err(ImageError::InvalidConfig(
                    "no FAT16 layout fits this volume".into(),
                ));
            }
            spc *= 2;
        }
    }

    fn layout(total_sectors: u32, sectors_per_cluster: u32, fat_type: FatType) -> Self {
        let (reserved, root_entries, root_cluster) = match fat_type {
            FatType::Fat32 => (32, 0, 2),
            _ => (1, 512, 0),
        };
        let root_sectors = root_entries * 32 / SECTOR_SIZE;
        let clusters = u64::from((total_sectors - reserved - root_sectors) / sectors_per_cluster);
        let fat_bytes = match fat_type {
            FatType::Fat12 => ((clusters + 2) * 3).div_ceil(2),
            FatType::Fat16 => (clusters + 2) * 2,
            FatType::Fat32 => (clusters + 2) * 4,
        };

        Self {
            bytes_per_sector: SECTOR_SIZE,
            sectors_per_cluster,
            reserved_sector_count: reserved,
            fat_count: 2,
            root_entry_count: root_entries,
            sectors_per_fat: fat_bytes.div_ceil(u64::from(SECTOR_SIZE)) as u32,
            total_sector_count: total_sectors,
            root_cluster,
            media: MEDIA_FIXED_DISK,
            fat_type,
        }
    }

    pub fn cluster_size(&self) -> u64 {
        u64::from(self.sectors_per_cluster) * u64::from(self.bytes_per_sector)
    }

    fn root_dir_sectors(&self) -> u32 {
        (self.root_entry_count * 32).div_ceil(self.bytes_per_sector)
    }

    fn data_start_sector(&self) -> u32 {
        self.reserved_sector_count
            .saturating_add(self.fat_count.saturating_mul(self.sectors_per_fat))
            .saturating_add(self.root_dir_sectors())
    }

    pub fn fat_area_start(&self) -> u64 {
        u64::from(self.reserved_sector_count) * u64::from(self.bytes_per_sector)
    }

    /// Size of one FAT copy in bytes.
    pub fn fat_size(&self) -> u64 {
        u64::from(self.sectors_per_fat) * u64::from(self.bytes_per_sector)
    }

    pub fn root_dir_start(&self) -> u64 {
        self.fat_area_start() + u64::from(self.fat_count) * self.fat_size()
    }

    /// Size in bytes of the fixed FAT12/16 root directory.
    pub fn root_dir_size(&self) -> u64 {
        u64::from(self.root_entry_count) * 32
    }

    pub fn data_area_start(&self) -> u64 {
        u64::from(self.data_start_sector()) * u64::from(self.bytes_per_sector)
    }

    /// Number of data clusters on the volume.
    pub fn cluster_count(&self) -> u32 {
        (self.total_sector_count - self.data_start_sector()) / self.sectors_per_cluster
    }

    /// Highest valid cluster number.
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count() + 1
    }

    /// Byte offset of data cluster `cluster` (which must be >= 2).
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_area_start() + u64::from(cluster - 2) * self.cluster_size()
    }

    pub fn boot_sector(&self, label: &[u8; 11], volume_id: u32) -> [u8; 512] {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut bs = [0u8; 512];
        let jump: [u8; 3] = if fat32 {
            [0xEB, 0x58, 0x90]
        } else {
            [0xEB, 0x3C, 0x90]
        };
        bs[..3].copy_from_slice(&jump);
        bs[3..11].copy_from_slice(b"MSWIN4.1");
        put_le_u16(&mut bs, 11, self.bytes_per_sector as u16);
        bs[13] = self.sectors_per_cluster as u8;
        put_le_u16(&mut bs, 14, self.reserved_sector_count as u16);
        bs[16] = self.fat_count as u8;
        put_le_u16(&mut bs, 17, self.root_entry_count as u16);
        match u16::try_from(self.total_sector_count) {
            Ok(total) if !fat32 => put_le_u16(&mut bs, 19, total),
            _ => put_le_u32(&mut bs, 32, self.total_sector_count),
        }
        bs[21] = self.media;
        if !fat32 {
            put_le_u16(&mut bs, 22, self.sectors_per_fat as u16);
        }
        put_le_u16(&mut bs, 24, 63); // sectors per track
        put_le_u16(&mut bs, 26, 255); // heads

        let ext = if fat32 {
            put_le_u32(&mut bs, 36, self.sectors_per_fat);
            put_le_u32(&mut bs, 44, self.root_cluster);
            put_le_u16(&mut bs, 48, 1); // FSInfo sector
            put_le_u16(&mut bs, 50, 6); // backup boot sector
            64
        } else {
            36
        };
        bs[ext] = 0x80; // drive number
        bs[ext + 2] = 0x29; // extended boot signature
        put_le_u32(&mut bs, ext + 3, volume_id);
        bs[ext + 7..ext + 18].copy_from_slice(label);
        bs[ext + 18..ext + 26].copy_from_slice(self.fat_type.fs_type_label());

        bs[510] = 0x55;
        bs[511] = 0xAA;
        bs
    }
}

/// Converts a volume label to the padded 11-byte on-disk form.
pub fn label_bytes(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let cleaned: Vec<u8> = label
        .trim()
        .bytes()
        .map(|b| match b.to_ascii_uppercase() {
            c @ (b'A'..=b'Z' | b'0'..=b'9' | b' ' | b'_' | b'-') => c,
            _ => b'_',
        })
        .take(11)
        .collect();
    if cleaned.is_empty() {
        out.copy_from_slice(b"NO NAME    ");
    } else {
        out[..cleaned.len()].copy_from_slice(&cleaned);
    }
    out
}

/// Volume serial derived from the label and size, so identical parameters
/// always produce byte-identical boot sectors.
pub fn volume_id(label: &[u8; 11], total_sectors: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in label.iter().chain(total_sectors.to_le_bytes().iter()) {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn fsinfo_sector() -> [u8; 512] {
    let mut s = [0u8; 512];
    put_le_u32(&mut s, 0, 0x4161_5252);
    put_le_u32(&mut s, 484, 0x6141_7272);
    put_le_u32(&mut s, 488, 0xFFFF_FFFF); // free count unknown
    put_le_u32(&mut s, 492, 0xFFFF_FFFF); // next free unknown
    put_le_u32(&mut s, 508, 0xAA55_0000);
    s
}

/// Writes an empty FAT file system onto `dev`, sized to the whole device.
///
/// The device must read as zeros beyond what is written here: the boot
/// sector (plus FSInfo and backup copies on FAT32), the reserved FAT
/// entries in every FAT copy, and the volume-label entry in the root
/// directory.
pub fn format(dev: &mut BlockDevice, label: &str) -> Result<FatGeometry> {
    let total = u32::try_from(dev.length() / u64::from(SECTOR_SIZE))
        .map_err(|_| ImageError::InvalidConfig("volume too large for FAT32".into()))?;
    let geo = FatGeometry::plan(total)?;
    let label = label_bytes(label);
    let boot = geo.boot_sector(&label, volume_id(&label, total));

    dev.write_all_at(0, &boot)?;
    if geo.fat_type == FatType::Fat32 {
        let fsinfo = fsinfo_sector();
        dev.write_all_at(u64::from(SECTOR_SIZE), &fsinfo)?;
        dev.write_all_at(6 * u64::from(SECTOR_SIZE), &boot)?;
        dev.write_all_at(7 * u64::from(SECTOR_SIZE), &fsinfo)?;
    }

    let mut first = vec![0u8; SECTOR_SIZE as usize];
    let marker = geo.fat_type.end_of_chain_marker();
    table::set_packed(&mut first, 0, (marker & !0xFF) | u32::from(geo.media), geo.fat_type);
    table::set_packed(&mut first, 1, marker, geo.fat_type);
    if geo.fat_type == FatType::Fat32 {
        table::set_packed(&mut first, geo.root_cluster, marker, geo.fat_type);
    }
    for copy in 0..u64::from(geo.fat_count) {
        dev.write_all_at(geo.fat_area_start() + copy * geo.fat_size(), &first)?;
    }

    if label != *b"NO NAME    " {
        let entry = encode_entry(&label, ATTR_VOLUME_ID, 0, 0, OffsetDateTime::UNIX_EPOCH);
        let root = match geo.fat_type {
            FatType::Fat32 => geo.cluster_offset(geo.root_cluster),
            _ => geo.root_dir_start(),
        };
        dev.write_all_at(root, &entry)?;
    }
    dev.flush()?;

    info!(
        fat_type = geo.fat_type.name(),
        total_sectors = total,
        sectors_per_cluster = geo.sectors_per_cluster,
        "formatted FAT volume"
    );
    Ok(geo)
}
