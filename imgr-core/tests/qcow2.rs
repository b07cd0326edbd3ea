use imgr_core::endian::{put_be_u32, put_be_u64};
use imgr_core::vdisk::{BlockDevice, ClusterMapping, Qcow2Disk};
use imgr_core::{ContainerKind, ImageError, container};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

const CLUSTER_BITS: u32 = 16;
const CLUSTER: u64 = 1 << CLUSTER_BITS;
const COPIED: u64 = 1 << 63;
const COMPRESSED: u64 = 1 << 62;
const ZERO: u64 = 1;

/// Builds a four-cluster guest disk: header in cluster 0, L1 in cluster 1,
/// L2 in cluster 2 and one data cluster (filled with 0xA5) in cluster 3.
/// `l2` gives the L2 entries for guest clusters 0..4.
fn fixture(dir: &TempDir, name: &str, version: u32, l2: [u64; 4]) -> PathBuf {
    let mut image = vec![0u8; (CLUSTER * 4) as usize];
    image[..4].copy_from_slice(b"QFI\xfb");
    put_be_u32(&mut image, 4, version);
    put_be_u32(&mut image, 20, CLUSTER_BITS);
    put_be_u64(&mut image, 24, CLUSTER * 4);
    put_be_u32(&mut image, 36, 1);
    put_be_u64(&mut image, 40, CLUSTER);
    if version >= 3 {
        put_be_u32(&mut image, 96, 4);
        put_be_u32(&mut image, 100, 104);
    }
    put_be_u64(&mut image, CLUSTER as usize, (CLUSTER * 2) | COPIED);
    for (i, entry) in l2.iter().enumerate() {
        put_be_u64(&mut image, (CLUSTER * 2) as usize + i * 8, *entry);
    }
    image[(CLUSTER * 3) as usize..].fill(0xA5);

    let path = dir.path().join(name);
    fs::write(&path, image).unwrap();
    path
}

fn read_cluster(path: &Path, index: u64) -> imgr_core::Result<Vec<u8>> {
    let mut dev = BlockDevice::open(path, false)?;
    let mut buf = vec![0u8; CLUSTER as usize];
    dev.read_exact_at(index * CLUSTER, &mut buf)?;
    Ok(buf)
}

#[test]
fn l2_entries_map_to_the_expected_clusters() {
    let dir = TempDir::new().unwrap();
    let data = (CLUSTER * 3) | COPIED;
    let path = fixture(
        &dir,
        "mapped.qcow2",
        3,
        [data, data | ZERO, 0, (CLUSTER * 3) | COMPRESSED],
    );

    let mut disk = Qcow2Disk::open(&path, false).unwrap();
    assert_eq!(disk.length(), CLUSTER * 4);
    assert_eq!(disk.cluster_size(), CLUSTER);
    assert_eq!(disk.cluster_mapping(0).unwrap(), ClusterMapping::Data(CLUSTER * 3));
    assert_eq!(disk.cluster_mapping(CLUSTER + 17).unwrap(), ClusterMapping::Zero);
    assert_eq!(
        disk.cluster_mapping(CLUSTER * 2).unwrap(),
        ClusterMapping::Unallocated
    );
    assert!(disk.cluster_mapping(CLUSTER * 3).unwrap_err().is_unsupported());
    assert_eq!(disk.physical_offset(100).unwrap(), Some(CLUSTER * 3 + 100));
    assert_eq!(disk.physical_offset(CLUSTER + 100).unwrap(), None);
}

#[test]
fn zero_flag_reads_as_zeros_even_with_a_host_offset() {
    let dir = TempDir::new().unwrap();
    let data = (CLUSTER * 3) | COPIED;
    let path = fixture(&dir, "zero.qcow2", 3, [data, data | ZERO, 0, 0]);

    assert!(read_cluster(&path, 0).unwrap().iter().all(|&b| b == 0xA5));
    assert!(read_cluster(&path, 1).unwrap().iter().all(|&b| b == 0));
    assert!(read_cluster(&path, 2).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn version_two_ignores_the_zero_bit() {
    let dir = TempDir::new().unwrap();
    let data = (CLUSTER * 3) | COPIED;
    let path = fixture(&dir, "v2.qcow2", 2, [0, data | ZERO, 0, 0]);

    assert!(read_cluster(&path, 1).unwrap().iter().all(|&b| b == 0xA5));
}

#[test]
fn compressed_clusters_are_unsupported() {
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "compressed.qcow2",
        3,
        [(CLUSTER * 3) | COMPRESSED, 0, 0, 0],
    );

    let err = read_cluster(&path, 0).unwrap_err();
    assert!(err.is_unsupported());
    assert!(matches!(err, ImageError::Unsupported(_)));

    // The qcow2 signature is still recognized; the volume inside just
    // cannot be read, so listing falls back to the opaque entry.
    assert_eq!(container::detect(&path).unwrap(), Some(ContainerKind::Qcow2));
    let entries = container::list(&path, Arc::new(AtomicBool::new(true)));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "compressed.qcow2");
}

#[test]
fn backing_files_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir, "backed.qcow2", 3, [0; 4]);
    let mut raw = fs::read(&path).unwrap();
    put_be_u64(&mut raw, 8, 512);
    fs::write(&path, raw).unwrap();

    assert!(Qcow2Disk::open(&path, false).unwrap_err().is_unsupported());
}

#[test]
fn read_only_devices_refuse_writes() {
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir, "ro.qcow2", 3, [0; 4]);

    let mut dev = BlockDevice::open(&path, false).unwrap();
    assert!(matches!(dev.write_all_at(0, &[1, 2, 3]), Err(ImageError::Io(_))));
}

#[test]
fn writes_allocate_clusters_on_demand() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("grow.qcow2");
    let mut dev = imgr_core::vdisk::create_qcow2(&path, 4, "GROW").unwrap();
    let before = fs::metadata(&path).unwrap().len();

    let offset = 3 * 1024 * 1024 + 7;
    dev.write_all_at(offset, b"written late").unwrap();
    dev.close().unwrap();
    assert!(fs::metadata(&path).unwrap().len() > before);

    let mut dev = BlockDevice::open(&path, false).unwrap();
    let mut buf = [0u8; 12];
    dev.read_exact_at(offset, &mut buf).unwrap();
    assert_eq!(&buf, b"written late");
}
