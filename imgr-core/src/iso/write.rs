//! ISO 9660 authoring from a host directory tree.
//!
//! Authoring runs in two passes: the whole tree is read into an arena of
//! [`IsoNode`]s and every directory and file is assigned an extent, then the
//! descriptors, path tables, directory blocks and file data are written in
//! sector order. Extents must be known up front because the primary volume
//! descriptor declares the volume size and the path tables point at every
//! directory.
use super::{
    FIRST_DESCRIPTOR_SECTOR, FLAG_DIRECTORY, PVD_ROOT_RECORD, RECORD_HEADER_LEN, SECTOR_SIZE,
    STANDARD_ID, VD_PRIMARY, VD_TERMINATOR, encode_recording_date,
};
use crate::MAX_DEPTH;
use crate::endian::{put_be_u16, put_be_u32, put_both_u16, put_both_u32, put_le_u16, put_le_u32};
use crate::error::{ImageError, Result};
use crate::task::Task;
use crate::util::{copy_exact, host_mtime, is_same_file};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info};
use walkdir::WalkDir;

const MAX_IDENT_LEN: usize = 31;
const MAX_EXT_LEN: usize = 8;
const MAX_VOLUME_ID_LEN: usize = 32;
/// The `.` and `..` records that open every directory.
const SELF_RECORDS_LEN: u64 = 68;
const L_PATH_TABLE_SECTOR: u64 = FIRST_DESCRIPTOR_SECTOR + 2;

/// One directory or file of the tree being authored.
#[derive(Debug)]
struct IsoNode {
    /// Host file name until identifiers are assigned, then the on-disc
    /// identifier without its `;1` version.
    ident: String,
    host: PathBuf,
    is_dir: bool,
    /// File length, or the directory's sector-rounded data length.
    size: u32,
    modified: OffsetDateTime,
    parent: usize,
    children: Vec<usize>,
    extent: u32,
}

impl IsoNode {
    fn record_ident(&self) -> Vec<u8> {
        if self.is_dir {
            self.ident.as_bytes().to_vec()
        } else {
            format!("{};1", self.ident).into_bytes()
        }
    }
}

struct Layout {
    /// Directories in path-table order: by level, then parent, then name.
    dirs: Vec<usize>,
    path_table_len: u32,
    l_table: u32,
    m_table: u32,
    total_sectors: u32,
}

/// Writes an ISO 9660 image of the tree under `source` to `output`.
pub(crate) fn create_iso(
    source: &Path,
    output: &Path,
    label: &str,
    task: &mut Task<'_>,
) -> Result<()> {
    let mut nodes = build_tree(source, output)?;
    assign_identifiers(&mut nodes);
    let layout = lay_out(&mut nodes)?;
    debug!(
        directories = layout.dirs.len(),
        sectors = layout.total_sectors,
        "laid out ISO image"
    );

    let mut w = BufWriter::new(File::create(output)?);
    let now = OffsetDateTime::now_utc();

    pad_to_sector(&mut w, FIRST_DESCRIPTOR_SECTOR)?;
    w.write_all(&primary_descriptor(&nodes, &layout, label, now))?;
    w.write_all(&terminator_descriptor())?;

    let (l_table, m_table) = path_tables(&nodes, &layout);
    pad_to_sector(&mut w, u64::from(layout.l_table))?;
    w.write_all(&l_table)?;
    pad_to_sector(&mut w, u64::from(layout.m_table))?;
    w.write_all(&m_table)?;

    for &dir in &layout.dirs {
        task.check()?;
        pad_to_sector(&mut w, u64::from(nodes[dir].extent))?;
        w.write_all(&directory_block(&nodes, dir))?;
    }

    for &dir in &layout.dirs {
        for &child in &nodes[dir].children {
            let node = &nodes[child];
            if node.is_dir || node.size == 0 {
                continue;
            }
            pad_to_sector(&mut w, u64::from(node.extent))?;
            let mut src = File::open(&node.host)?;
            copy_exact(&mut src, u64::from(node.size), &mut w, task)?;
        }
    }
    pad_to_sector(&mut w, u64::from(layout.total_sectors))?;
    w.flush()?;

    info!(
        output = %output.display(),
        sectors = layout.total_sectors,
        "wrote ISO 9660 image"
    );
    Ok(())
}

fn build_tree(source: &Path, output: &Path) -> Result<Vec<IsoNode>> {
    let meta = fs::metadata(source)?;
    if !meta.is_dir() {
        return Err(ImageError::InvalidConfig(format!(
            "{} is not a directory",
            source.display()
        )));
    }

    let mut nodes = vec![IsoNode {
        ident: String::new(),
        host: source.to_path_buf(),
        is_dir: true,
        size: 0,
        modified: host_mtime(&meta),
        parent: 0,
        children: Vec::new(),
        extent: 0,
    }];
    let mut dirs = HashMap::from([(source.to_path_buf(), 0usize)]);

    for item in WalkDir::new(source)
        .min_depth(1)
        .max_depth(MAX_DEPTH)
        .sort_by_file_name()
    {
        let item = item.map_err(|e| ImageError::Io(e.into()))?;
        if is_same_file(item.path(), output) {
            continue;
        }
        let Some(&parent) = item.path().parent().and_then(|p| dirs.get(p)) else {
            continue;
        };
        let file_type = item.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            debug!(path = %item.path().display(), "skipping non-regular file");
            continue;
        }

        let meta = item.metadata().map_err(|e| ImageError::Io(e.into()))?;
        let size = if file_type.is_file() {
            u32::try_from(meta.len()).map_err(|_| {
                ImageError::InvalidConfig(format!(
                    "{} is too large for ISO 9660 (4 GiB limit)",
                    item.path().display()
                ))
            })?
        } else {
            0
        };

        let id = nodes.len();
        nodes.push(IsoNode {
            ident: item.file_name().to_string_lossy().into_owned(),
            host: item.path().to_path_buf(),
            is_dir: file_type.is_dir(),
            size,
            modified: host_mtime(&meta),
            parent,
            children: Vec::new(),
            extent: 0,
        });
        nodes[parent].children.push(id);
        if file_type.is_dir() {
            dirs.insert(item.path().to_path_buf(), id);
        }
    }
    Ok(nodes)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .collect()
}

fn compose_identifier(base: &str, ext: Option<&str>, suffix: &str) -> String {
    let ext = ext.map(|e| &e[..e.len().min(MAX_EXT_LEN)]);
    let room = MAX_IDENT_LEN - suffix.len() - ext.map_or(0, |e| e.len() + 1);
    let base = if base.is_empty() { "_" } else { base };
    let base = &base[..base.len().min(room)];
    match ext {
        Some(ext) => format!("{base}{suffix}.{ext}"),
        None => format!("{base}{suffix}"),
    }
}

/// Maps a host name to an identifier not yet in `taken`.
///
/// File names keep their extension: `notes.tar.gz` becomes `NOTES_TAR.GZ`.
fn iso_identifier(host_name: &str, is_dir: bool, taken: &mut HashSet<String>) -> String {
    let (base, ext) = if is_dir {
        (sanitize(host_name), None)
    } else {
        match host_name.rsplit_once('.') {
            Some((base, ext)) if !base.is_empty() => (sanitize(base), Some(sanitize(ext))),
            _ => (sanitize(host_name), Some(String::new())),
        }
    };

    let mut n = 0usize;
    loop {
        let suffix = if n == 0 { String::new() } else { format!("_{n}") };
        let candidate = compose_identifier(&base, ext.as_deref(), &suffix);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn assign_identifiers(nodes: &mut [IsoNode]) {
    for dir in 0..nodes.len() {
        if !nodes[dir].is_dir {
            continue;
        }
        let mut children = std::mem::take(&mut nodes[dir].children);
        let mut taken = HashSet::new();
        for &child in &children {
            let node = &mut nodes[child];
            node.ident = iso_identifier(&node.ident, node.is_dir, &mut taken);
        }
        children.sort_by(|&a, &b| nodes[a].ident.cmp(&nodes[b].ident));
        nodes[dir].children = children;
    }
}

fn record_len(ident_len: usize) -> u64 {
    ((RECORD_HEADER_LEN + ident_len + 1) & !1) as u64
}

fn path_entry_len(ident_len: usize) -> u64 {
    (8 + ident_len + (ident_len & 1)) as u64
}

/// Packs the records of `dir` into sectors and returns the sector-rounded
/// data length. A record never straddles a sector boundary.
fn directory_size(nodes: &[IsoNode], dir: usize) -> u64 {
    let mut used = SELF_RECORDS_LEN;
    for &child in &nodes[dir].children {
        let len = record_len(nodes[child].record_ident().len());
        if used % SECTOR_SIZE + len > SECTOR_SIZE {
            used = used.next_multiple_of(SECTOR_SIZE);
        }
        used += len;
    }
    used.next_multiple_of(SECTOR_SIZE)
}

fn lay_out(nodes: &mut [IsoNode]) -> Result<Layout> {
    let mut dirs = Vec::new();
    let mut queue = VecDeque::from([0usize]);
    while let Some(dir) = queue.pop_front() {
        dirs.push(dir);
        queue.extend(nodes[dir].children.iter().copied().filter(|&c| nodes[c].is_dir));
    }

    let path_table_len: u64 = dirs
        .iter()
        .map(|&d| path_entry_len(nodes[d].ident.len().max(1)))
        .sum();
    let table_sectors = path_table_len.div_ceil(SECTOR_SIZE);
    let l_table = L_PATH_TABLE_SECTOR;
    let m_table = l_table + table_sectors;
    let mut next = m_table + table_sectors;

    let too_large = || ImageError::InvalidConfig("tree is too large for an ISO 9660 volume".into());
    for &dir in &dirs {
        let size = directory_size(nodes, dir);
        nodes[dir].size = u32::try_from(size).map_err(|_| too_large())?;
        nodes[dir].extent = u32::try_from(next).map_err(|_| too_large())?;
        next += size / SECTOR_SIZE;
    }
    for &dir in &dirs {
        for i in 0..nodes[dir].children.len() {
            let child = nodes[dir].children[i];
            if nodes[child].is_dir || nodes[child].size == 0 {
                continue;
            }
            nodes[child].extent = u32::try_from(next).map_err(|_| too_large())?;
            next += u64::from(nodes[child].size).div_ceil(SECTOR_SIZE);
        }
    }

    Ok(Layout {
        dirs,
        path_table_len: u32::try_from(path_table_len).map_err(|_| too_large())?,
        l_table: l_table as u32,
        m_table: m_table as u32,
        total_sectors: u32::try_from(next).map_err(|_| too_large())?,
    })
}

fn directory_record(
    extent: u32,
    size: u32,
    is_dir: bool,
    ident: &[u8],
    modified: OffsetDateTime,
) -> Vec<u8> {
    let len = record_len(ident.len()) as usize;
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    put_both_u32(&mut rec, 2, extent);
    put_both_u32(&mut rec, 10, size);
    rec[18..25].copy_from_slice(&encode_recording_date(modified));
    rec[25] = if is_dir { FLAG_DIRECTORY } else { 0 };
    put_both_u16(&mut rec, 28, 1); // volume sequence number
    rec[32] = ident.len() as u8;
    rec[RECORD_HEADER_LEN..RECORD_HEADER_LEN + ident.len()].copy_from_slice(ident);
    rec
}

fn directory_block(nodes: &[IsoNode], dir: usize) -> Vec<u8> {
    let node = &nodes[dir];
    let parent = &nodes[node.parent];
    let mut block = vec![0u8; node.size as usize];

    let dot = directory_record(node.extent, node.size, true, &[0], node.modified);
    let dotdot = directory_record(parent.extent, parent.size, true, &[1], parent.modified);
    block[..dot.len()].copy_from_slice(&dot);
    block[dot.len()..dot.len() + dotdot.len()].copy_from_slice(&dotdot);

    let mut pos = SELF_RECORDS_LEN as usize;
    let sector = SECTOR_SIZE as usize;
    for &child in &node.children {
        let c = &nodes[child];
        let rec = directory_record(c.extent, c.size, c.is_dir, &c.record_ident(), c.modified);
        if pos % sector + rec.len() > sector {
            pos = pos.next_multiple_of(sector);
        }
        block[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }
    block
}

/// Builds the L-type and M-type path tables.
fn path_tables(nodes: &[IsoNode], layout: &Layout) -> (Vec<u8>, Vec<u8>) {
    let numbers: HashMap<usize, u16> = layout
        .dirs
        .iter()
        .enumerate()
        .map(|(i, &d)| (d, (i + 1) as u16))
        .collect();

    let mut l_table = Vec::with_capacity(layout.path_table_len as usize);
    let mut m_table = Vec::with_capacity(layout.path_table_len as usize);
    for &dir in &layout.dirs {
        let node = &nodes[dir];
        let ident: &[u8] = if dir == 0 { &[0] } else { node.ident.as_bytes() };
        let parent = numbers.get(&node.parent).copied().unwrap_or(1);

        let mut l = vec![0u8; path_entry_len(ident.len()) as usize];
        l[0] = ident.len() as u8;
        l[8..8 + ident.len()].copy_from_slice(ident);
        let mut m = l.clone();
        put_le_u32(&mut l, 2, node.extent);
        put_le_u16(&mut l, 6, parent);
        put_be_u32(&mut m, 2, node.extent);
        put_be_u16(&mut m, 6, parent);
        l_table.extend_from_slice(&l);
        m_table.extend_from_slice(&m);
    }
    (l_table, m_table)
}

fn padded_field(buf: &mut [u8], text: &str) {
    buf.fill(b' ');
    let bytes = text.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// 17-byte `YYYYMMDDHHMMSScc` + offset timestamp used in volume descriptors.
fn dec_datetime(t: OffsetDateTime) -> [u8; 17] {
    let mut out = [0u8; 17];
    let digits = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}00",
        t.year().clamp(0, 9999),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    );
    out[..16].copy_from_slice(digits.as_bytes());
    out[16] = (t.offset().whole_minutes() / 15) as i8 as u8;
    out
}

fn volume_identifier(label: &str) -> String {
    let id = sanitize(label.trim());
    if id.is_empty() {
        "CDROM".to_string()
    } else {
        id.chars().take(MAX_VOLUME_ID_LEN).collect()
    }
}

fn descriptor_header(kind: u8) -> Vec<u8> {
    let mut vd = vec![0u8; SECTOR_SIZE as usize];
    vd[0] = kind;
    vd[1..6].copy_from_slice(STANDARD_ID);
    vd[6] = 1; // version
    vd
}

fn primary_descriptor(
    nodes: &[IsoNode],
    layout: &Layout,
    label: &str,
    now: OffsetDateTime,
) -> Vec<u8> {
    let mut vd = descriptor_header(VD_PRIMARY);
    padded_field(&mut vd[8..40], "");
    padded_field(&mut vd[40..72], &volume_identifier(label));
    put_both_u32(&mut vd, 80, layout.total_sectors);
    put_both_u16(&mut vd, 120, 1); // volume set size
    put_both_u16(&mut vd, 124, 1); // volume sequence number
    put_both_u16(&mut vd, 128, SECTOR_SIZE as u16);
    put_both_u32(&mut vd, 132, layout.path_table_len);
    put_le_u32(&mut vd, 140, layout.l_table);
    put_be_u32(&mut vd, 148, layout.m_table);

    let root = &nodes[0];
    let root_record = directory_record(root.extent, root.size, true, &[0], root.modified);
    vd[PVD_ROOT_RECORD..PVD_ROOT_RECORD + root_record.len()].copy_from_slice(&root_record);

    padded_field(&mut vd[190..318], ""); // volume set
    padded_field(&mut vd[318..446], ""); // publisher
    padded_field(&mut vd[446..574], ""); // data preparer
    padded_field(&mut vd[574..702], "IMGR");
    padded_field(&mut vd[702..813], ""); // copyright, abstract, bibliographic files

    let stamp = dec_datetime(now);
    vd[813..830].copy_from_slice(&stamp); // creation
    vd[830..847].copy_from_slice(&stamp); // modification
    vd[847..863].fill(b'0'); // expiration: unset
    vd[864..881].copy_from_slice(&stamp); // effective
    vd[881] = 1; // file structure version
    vd
}

fn terminator_descriptor() -> Vec<u8> {
    descriptor_header(VD_TERMINATOR)
}

fn pad_to_sector(w: &mut BufWriter<File>, sector: u64) -> Result<()> {
    let target = sector * SECTOR_SIZE;
    let pos = w.stream_position()?;
    if pos > target {
        return Err(ImageError::corrupt(format!(
            "ISO layout overlaps at sector {sector}"
        )));
    }
    io::copy(&mut io::repeat(0).take(target - pos), w)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(ident: &str, is_dir: bool, parent: usize) -> IsoNode {
        IsoNode {
            ident: ident.to_string(),
            host: PathBuf::new(),
            is_dir,
            size: 0,
            modified: OffsetDateTime::UNIX_EPOCH,
            parent,
            children: Vec::new(),
            extent: 0,
        }
    }

    #[test]
    fn identifiers_keep_extensions_and_dedupe() {
        let mut taken = HashSet::new();
        assert_eq!(iso_identifier("readme.txt", false, &mut taken), "README.TXT");
        assert_eq!(iso_identifier("README.TXT", false, &mut taken), "README_1.TXT");
        assert_eq!(iso_identifier("Makefile", false, &mut taken), "MAKEFILE.");
        assert_eq!(iso_identifier("my docs", true, &mut taken), "MY_DOCS");
        assert_eq!(iso_identifier(".hidden", false, &mut taken), "_HIDDEN.");

        let long = iso_identifier(&"x".repeat(40), false, &mut taken);
        assert_eq!(long.len(), MAX_IDENT_LEN);
        assert!(long.ends_with('.'));
    }

    #[test]
    fn records_are_even_and_path_entries_padded() {
        assert_eq!(record_len(1), 34);
        assert_eq!(record_len(12), 46);
        assert_eq!(record_len(13), 46);
        assert_eq!(path_entry_len(1), 10);
        assert_eq!(path_entry_len(4), 12);
    }

    #[test]
    fn directory_exactly_filling_a_sector_stays_one_sector() {
        let mut nodes = vec![leaf("", true, 0)];
        // 18 records of 46 bytes and 24 of 48 bytes: 68 + 828 + 1152 = 2048.
        for i in 0..18 {
            nodes.push(leaf(&format!("A{i:06}.TXT"), false, 0));
        }
        for i in 0..24 {
            nodes.push(leaf(&format!("B{i:07}.TXT"), false, 0));
        }
        nodes[0].children = (1..nodes.len()).collect();
        assert_eq!(directory_size(&nodes, 0), SECTOR_SIZE);

        nodes.push(leaf("C.TXT", false, 0));
        let last = nodes.len() - 1;
        nodes[0].children.push(last);
        assert_eq!(directory_size(&nodes, 0), 2 * SECTOR_SIZE);
    }

    #[test]
    fn layout_places_directories_before_files() {
        let mut nodes = vec![leaf("", true, 0), leaf("SUB", true, 0), leaf("A.TXT", false, 0)];
        nodes[2].size = 5000;
        nodes.push(leaf("EMPTY.", false, 1));
        nodes[0].children = vec![2, 1];
        nodes[1].children = vec![3];

        let layout = lay_out(&mut nodes).unwrap();
        assert_eq!(layout.dirs, vec![0, 1]);
        assert_eq!(layout.path_table_len, 10 + 12);
        assert_eq!((layout.l_table, layout.m_table), (18, 19));
        assert_eq!(nodes[0].extent, 20);
        assert_eq!(nodes[1].extent, 21);
        assert_eq!(nodes[2].extent, 22);
        assert_eq!(nodes[3].extent, 0);
        assert_eq!(layout.total_sectors, 25);
    }

    proptest! {
        #[test]
        fn identifiers_use_d_characters_only(name in "\\PC{1,60}", is_dir in any::<bool>()) {
            let mut taken = HashSet::new();
            let ident = iso_identifier(&name, is_dir, &mut taken);
            prop_assert!(ident.len() <= MAX_IDENT_LEN);
            prop_assert!(!ident.is_empty());
            let dots = ident.matches('.').count();
            prop_assert_eq!(dots, usize::from(!is_dir));
            prop_assert!(
                ident
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '.')
            );
        }
    }
}
