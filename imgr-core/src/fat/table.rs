//! File Allocation Table entry encoding.
//!
//! FAT12 packs two 12-bit entries into three bytes; FAT16 entries are two
//! little-endian bytes; FAT32 entries are four little-endian bytes of which
//! only the low 28 bits are significant (the high nibble is reserved and is
//! preserved on write).
use super::boot::FatType;
use crate::endian::{le_u16, le_u32, put_le_u16, put_le_u32};

/// Byte offset of `cluster`'s entry from the start of a FAT.
pub fn entry_offset(cluster: u32, fat_type: FatType) -> u64 {
    let c = u64::from(cluster);
    match fat_type {
        FatType::Fat12 => c + c / 2,
        FatType::Fat16 => c * 2,
        FatType::Fat32 => c * 4,
    }
}

/// Number of bytes touched when reading or writing one entry.
pub fn entry_width(fat_type: FatType) -> usize {
    match fat_type {
        FatType::Fat12 | FatType::Fat16 => 2,
        FatType::Fat32 => 4,
    }
}

/// Decodes the entry for `cluster` stored at `buf[pos..]`.
pub fn decode(buf: &[u8], pos: usize, cluster: u32, fat_type: FatType) -> u32 {
    match fat_type {
        FatType::Fat12 => {
            let pair = u32::from(le_u16(buf, pos));
            if cluster & 1 == 0 {
                pair & 0x0FFF
            } else {
                pair >> 4
            }
        }
        FatType::Fat16 => u32::from(le_u16(buf, pos)),
        FatType::Fat32 => le_u32(buf, pos) & 0x0FFF_FFFF,
    }
}

/// Encodes `value` as the entry for `cluster` at `buf[pos..]`, leaving
/// neighbouring bits untouched.
pub fn encode(buf: &mut [u8], pos: usize, cluster: u32, value: u32, fat_type: FatType) {
    match fat_type {
        FatType::Fat12 => {
            let old = le_u16(buf, pos);
            let value = (value & 0x0FFF) as u16;
            let new = if cluster & 1 == 0 {
                (old & 0xF000) | value
            } else {
                (old & 0x000F) | (value << 4)
            };
            put_le_u16(buf, pos, new);
        }
        FatType::Fat16 => put_le_u16(buf, pos, value as u16),
        FatType::Fat32 => {
            let old = le_u32(buf, pos);
            put_le_u32(buf, pos, (old & 0xF000_0000) | (value & 0x0FFF_FFFF));
        }
    }
}

/// Writes the entry for `cluster` into an in-memory FAT.
pub fn set_packed(fat: &mut [u8], cluster: u32, value: u32, fat_type: FatType) {
    encode(fat, entry_offset(cluster, fat_type) as usize, cluster, value, fat_type);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn get_packed(fat: &[u8], cluster: u32, fat_type: FatType) -> u32 {
        decode(fat, entry_offset(cluster, fat_type) as usize, cluster, fat_type)
    }

    #[test]
    fn fat12_packing_matches_on_disk_layout() {
        let mut fat = vec![0u8; 6];
        set_packed(&mut fat, 0, 0xFF8, FatType::Fat12);
        set_packed(&mut fat, 1, 0xFFF, FatType::Fat12);
        assert_eq!(&fat[..3], &[0xF8, 0xFF, 0xFF]);

        set_packed(&mut fat, 2, 0x003, FatType::Fat12);
        set_packed(&mut fat, 3, 0xABC, FatType::Fat12);
        assert_eq!(&fat[3..6], &[0x03, 0xC0, 0xAB]);
        assert_eq!(get_packed(&fat, 2, FatType::Fat12), 0x003);
        assert_eq!(get_packed(&fat, 3, FatType::Fat12), 0xABC);
    }

    #[test]
    fn fat32_preserves_reserved_nibble() {
        let mut fat = vec![0u8; 12];
        fat[8..12].copy_from_slice(&0xA000_0000u32.to_le_bytes());
        set_packed(&mut fat, 2, 0x0FFF_FFFF, FatType::Fat32);
        assert_eq!(le_u32(&fat, 8), 0xAFFF_FFFF);
        assert_eq!(get_packed(&fat, 2, FatType::Fat32), 0x0FFF_FFFF);
    }

    fn any_fat_type() -> impl Strategy<Value = FatType> {
        prop_oneof![
            Just(FatType::Fat12),
            Just(FatType::Fat16),
            Just(FatType::Fat32)
        ]
    }

    proptest! {
        #[test]
        fn writing_one_entry_never_disturbs_neighbours(
            fat_type in any_fat_type(),
            seed in proptest::collection::vec(any::<u8>(), 100),
            cluster in 1u32..20,
            value in any::<u32>(),
        ) {
            let mut fat = seed.clone();
            let before: Vec<u32> = (0..24).map(|c| get_packed(&seed, c, fat_type)).collect();
            set_packed(&mut fat, cluster, value, fat_type);

            let mask = match fat_type {
                FatType::Fat12 => 0x0FFF,
                FatType::Fat16 => 0xFFFF,
                FatType::Fat32 => 0x0FFF_FFFF,
            };
            for c in 0..24u32 {
                let got = get_packed(&fat, c, fat_type);
                if c == cluster {
                    prop_assert_eq!(got, value & mask);
                } else {
                    prop_assert_eq!(got, before[c as usize]);
                }
            }
        }
    }
}
