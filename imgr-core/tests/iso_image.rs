use flate2::Compression;
use flate2::write::GzEncoder;
use imgr_core::{ContainerKind, Entry, ImageError, container};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn sample_tree(root: &Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("readme.txt"), b"hello from the image\n").unwrap();
    fs::write(root.join("sub/inner.txt"), vec![0x5A; 5000]).unwrap();
    File::create(root.join("empty.dat")).unwrap();
}

fn build_iso(dir: &TempDir, source: &Path) -> PathBuf {
    let iso = dir.path().join("disk.iso");
    container::create_iso(source, &iso, "TESTVOL", running(), |_| {}).unwrap();
    iso
}

fn paths(entries: &[Entry]) -> Vec<String> {
    let mut paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
    paths.sort();
    paths
}

#[test]
fn authored_image_round_trips() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = build_iso(&dir, &source);

    assert_eq!(container::detect(&iso).unwrap(), Some(ContainerKind::Iso));
    assert_eq!(fs::metadata(&iso).unwrap().len() % 2048, 0);

    let entries = container::list(&iso, running());
    assert_eq!(
        paths(&entries),
        ["EMPTY.DAT", "README.TXT", "SUB", "SUB/INNER.TXT"]
    );
    let inner = entries.iter().find(|e| e.path == "SUB/INNER.TXT").unwrap();
    assert_eq!(inner.size, 5000);
    assert!(entries.iter().any(|e| e.path == "SUB" && e.is_directory));

    let out = dir.path().join("out");
    let mut progress = 0;
    container::extract(&iso, &out, None, running(), |bytes| progress = bytes).unwrap();
    assert_eq!(
        fs::read(out.join("README.TXT")).unwrap(),
        b"hello from the image\n"
    );
    assert_eq!(fs::read(out.join("SUB/INNER.TXT")).unwrap(), vec![0x5A; 5000]);
    assert_eq!(fs::metadata(out.join("EMPTY.DAT")).unwrap().len(), 0);
    assert_eq!(progress, 5021);
}

#[test]
fn selective_extraction_writes_only_the_target() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = build_iso(&dir, &source);

    let out = dir.path().join("one");
    container::extract(&iso, &out, Some("sub/inner.txt"), running(), |_| {}).unwrap();
    let written: Vec<_> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(written, ["INNER.TXT"]);

    let err = container::extract(&iso, &out, Some("sub/missing.txt"), running(), |_| {})
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ImageError>(),
        Some(ImageError::NotFound(_))
    ));
}

#[test]
fn directory_filling_a_whole_sector_lists_every_record() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    fs::create_dir(&source).unwrap();
    // "." and ".." take 68 bytes; 18 records of 46 bytes and 24 of 48 fill
    // the remaining 1980 bytes exactly.
    for i in 0..18 {
        fs::write(source.join(format!("a{i:06}.txt")), b"a").unwrap();
    }
    for i in 0..24 {
        fs::write(source.join(format!("b{i:07}.txt")), b"b").unwrap();
    }
    let iso = build_iso(&dir, &source);
    assert_eq!(container::list(&iso, running()).len(), 42);

    fs::write(source.join("c.txt"), b"c").unwrap();
    fs::remove_file(&iso).unwrap();
    let iso = build_iso(&dir, &source);
    let entries = container::list(&iso, running());
    assert_eq!(entries.len(), 43);
    assert!(entries.iter().any(|e| e.path == "C.TXT"));
}

#[test]
fn listing_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = build_iso(&dir, &source);

    let first = container::list(&iso, running());
    let second = container::list(&iso, running());
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn gzipped_images_are_listed_transparently() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = build_iso(&dir, &source);

    let gz = dir.path().join("disk.iso.gz");
    let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::fast());
    enc.write_all(&fs::read(&iso).unwrap()).unwrap();
    enc.finish().unwrap();

    assert_eq!(container::detect(&gz).unwrap(), Some(ContainerKind::Iso));
    assert_eq!(container::list(&gz, running()), container::list(&iso, running()));
}

#[test]
fn corrupt_image_lists_as_one_opaque_entry() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = build_iso(&dir, &source);

    // Point the root directory record of the primary descriptor far past
    // the end of the file.
    let mut file = OpenOptions::new().write(true).open(&iso).unwrap();
    file.seek(SeekFrom::Start(16 * 2048 + 156 + 2)).unwrap();
    file.write_all(&0x00FF_FFFFu32.to_le_bytes()).unwrap();
    file.write_all(&0x00FF_FFFFu32.to_be_bytes()).unwrap();
    drop(file);

    let entries = container::list(&iso, running());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "disk.iso");
    assert!(!entries[0].is_directory);
    assert_eq!(entries[0].size, fs::metadata(&iso).unwrap().len());

    let err = container::extract(&iso, &dir.path().join("out"), None, running(), |_| {})
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ImageError>(),
        Some(ImageError::Corrupt(_))
    ));
}

#[test]
fn cancelled_authoring_leaves_no_output() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = dir.path().join("cancelled.iso");

    let stopped = Arc::new(AtomicBool::new(false));
    let err = container::create_iso(&source, &iso, "X", stopped, |_| {}).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ImageError>(),
        Some(ImageError::Cancelled)
    ));
    assert!(!iso.exists());
}

/// Extent of the record named `name` among the records of the directory at
/// `dir_extent` (first sector only).
fn record_extent(bytes: &[u8], dir_extent: u32, name: &[u8]) -> u32 {
    let sector = &bytes[dir_extent as usize * 2048..][..2048];
    let mut pos = 0;
    while pos < sector.len() && sector[pos] != 0 {
        let len = sector[pos] as usize;
        let ident = &sector[pos + 33..pos + 33 + sector[pos + 32] as usize];
        if ident == name {
            return u32::from_le_bytes(sector[pos + 2..pos + 6].try_into().unwrap());
        }
        pos += len;
    }
    panic!("no record {:?}", String::from_utf8_lossy(name));
}

struct PathRecord {
    name: Vec<u8>,
    extent: u32,
    parent: u16,
}

fn decode_path_table(table: &[u8], big_endian: bool) -> Vec<PathRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < table.len() {
        let n = table[pos] as usize;
        let extent: [u8; 4] = table[pos + 2..pos + 6].try_into().unwrap();
        let parent: [u8; 2] = table[pos + 6..pos + 8].try_into().unwrap();
        let (extent, parent) = if big_endian {
            (u32::from_be_bytes(extent), u16::from_be_bytes(parent))
        } else {
            (u32::from_le_bytes(extent), u16::from_le_bytes(parent))
        };
        records.push(PathRecord {
            name: table[pos + 8..pos + 8 + n].to_vec(),
            extent,
            parent,
        });
        pos += 8 + n + (n & 1);
    }
    records
}

#[test]
fn path_tables_point_at_every_directory() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    fs::create_dir_all(source.join("alpha/beta")).unwrap();
    fs::create_dir_all(source.join("zeta")).unwrap();
    fs::write(source.join("alpha/beta/gamma.txt"), b"gamma").unwrap();
    fs::write(source.join("alpha/one.txt"), b"one").unwrap();
    fs::write(source.join("top.txt"), b"top").unwrap();
    let iso = build_iso(&dir, &source);
    let bytes = fs::read(&iso).unwrap();

    let pvd = &bytes[16 * 2048..17 * 2048];
    let table_len = u32::from_le_bytes(pvd[132..136].try_into().unwrap()) as usize;
    assert_eq!(
        u32::from_be_bytes(pvd[136..140].try_into().unwrap()) as usize,
        table_len
    );
    let l_at = u32::from_le_bytes(pvd[140..144].try_into().unwrap()) as usize;
    let m_at = u32::from_be_bytes(pvd[148..152].try_into().unwrap()) as usize;
    assert_eq!(l_at, 18);
    assert!(m_at > l_at);

    let root = u32::from_le_bytes(pvd[156 + 2..156 + 6].try_into().unwrap());
    let alpha = record_extent(&bytes, root, b"ALPHA");
    let zeta = record_extent(&bytes, root, b"ZETA");
    let beta = record_extent(&bytes, alpha, b"BETA");

    // Breadth-first numbering: root is 1, its children 2 and 3, then BETA.
    let expected: [(&[u8], u32, u16); 4] = [
        (&[0], root, 1),
        (b"ALPHA", alpha, 1),
        (b"ZETA", zeta, 1),
        (b"BETA", beta, 2),
    ];
    for (at, big_endian) in [(l_at, false), (m_at, true)] {
        let table = decode_path_table(&bytes[at * 2048..at * 2048 + table_len], big_endian);
        assert_eq!(table.len(), expected.len());
        for (record, (name, extent, parent)) in table.iter().zip(expected) {
            assert_eq!(record.name, name);
            assert_eq!(record.extent, extent);
            assert_eq!(record.parent, parent);
        }
    }
}

#[test]
fn hybrid_img_without_fat_volume_reads_as_iso() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    sample_tree(&source);
    let iso = build_iso(&dir, &source);

    // An isohybrid image: MBR signature in front of the ISO descriptors.
    let img = dir.path().join("hybrid.img");
    let mut bytes = fs::read(&iso).unwrap();
    bytes[510] = 0x55;
    bytes[511] = 0xAA;
    fs::write(&img, &bytes).unwrap();
    assert_eq!(container::detect(&img).unwrap(), Some(ContainerKind::FatImage));

    let entries = container::list(&img, running());
    assert_eq!(
        paths(&entries),
        ["EMPTY.DAT", "README.TXT", "SUB", "SUB/INNER.TXT"]
    );

    let out = dir.path().join("out");
    container::extract(&img, &out, Some("sub/inner.txt"), running(), |_| {}).unwrap();
    assert_eq!(fs::read(out.join("INNER.TXT")).unwrap(), vec![0x5A; 5000]);
}
