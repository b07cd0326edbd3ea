//! Format detection and the listing/extraction/authoring entry points.
//!
//! This is the layer front-ends talk to. It picks the driver for a file,
//! normalizes every driver's output into [`Entry`] values, and keeps an
//! optional listing cache that is invalidated by every mutating call made
//! through [`Containers`].
use crate::decompress::{decompress_image, inner_extension, read_head};
use crate::entry::Entry;
use crate::error::{ImageError, Result};
use crate::fat::{self, FatVolume};
use crate::iso::{self, IsoImage};
use crate::task::Task;
use crate::util::{host_mtime, path_components};
use crate::vdisk::{self, BlockDevice, QCOW2_MAGIC};
use anyhow::Context;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Offset of the `CD001` identifier in the first volume descriptor.
const ISO_SIGNATURE_OFFSET: usize = 0x8001;
const SNIFF_LEN: usize = ISO_SIGNATURE_OFFSET + 5;
/// Largest authored disk: the sector count must fit a FAT32 BPB.
pub const MAX_IMAGE_MB: u64 = 2_097_151;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Iso,
    /// A raw FAT volume image.
    FatImage,
    /// A qcow2 disk holding a FAT volume.
    Qcow2,
}

impl ContainerKind {
    pub fn name(self) -> &'static str {
        match self {
            ContainerKind::Iso => "ISO 9660",
            ContainerKind::FatImage => "FAT image",
            ContainerKind::Qcow2 => "qcow2",
        }
    }
}

fn has_iso_signature(head: &[u8]) -> bool {
    head.get(ISO_SIGNATURE_OFFSET..SNIFF_LEN) == Some(iso::STANDARD_ID.as_slice())
}

/// Classifies an image from its leading bytes. `ext` (lower case, without
/// the dot) only decides which signature wins when several match.
pub fn sniff(head: &[u8], ext: &str) -> Option<ContainerKind> {
    if head.starts_with(&QCOW2_MAGIC) {
        return Some(ContainerKind::Qcow2);
    }
    let iso = has_iso_signature(head);
    let boot = head.len() >= 512 && head[510] == 0x55 && head[511] == 0xAA;
    match (iso, boot) {
        (true, true) if matches!(ext, "img" | "ima" | "raw") => Some(ContainerKind::FatImage),
        (true, _) => Some(ContainerKind::Iso),
        (false, true) => Some(ContainerKind::FatImage),
        (false, false) => None,
    }
}

/// Detects the container format of `path`, looking through `.gz`/`.xz`/`.zst`
/// compression.
pub fn detect(path: &Path) -> Result<Option<ContainerKind>> {
    let head = read_head(path, SNIFF_LEN)?;
    Ok(sniff(&head, &inner_extension(path)))
}

/// Returns `true` if `path` is an image one of the drivers understands.
pub fn is_disk_image(path: &Path) -> bool {
    matches!(detect(path), Ok(Some(_)))
}

/// Hybrid images carry both an ISO 9660 descriptor set and a boot record.
/// When the boot sector does not describe a FAT volume, the ISO side is
/// read instead.
fn effective_kind(kind: ContainerKind, image: &Path) -> Result<ContainerKind> {
    if kind != ContainerKind::FatImage {
        return Ok(kind);
    }
    match FatVolume::open(BlockDevice::open(image, false)?) {
        Err(ImageError::BadSignature(_) | ImageError::Corrupt(_))
            if has_iso_signature(&read_head(image, SNIFF_LEN)?) =>
        {
            debug!(path = %image.display(), "boot sector is not FAT; reading as ISO 9660");
            Ok(ContainerKind::Iso)
        }
        _ => Ok(kind),
    }
}

fn list_kind(kind: ContainerKind, path: &Path, task: &mut Task<'_>) -> Result<Vec<Entry>> {
    match effective_kind(kind, path)? {
        ContainerKind::Iso => IsoImage::open(path)?.list(task),
        ContainerKind::FatImage | ContainerKind::Qcow2 => {
            FatVolume::open(BlockDevice::open(path, false)?)?.list(task)
        }
    }
}

/// The single entry reported for an image that could not be parsed.
fn opaque_entry(path: &Path) -> Entry {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let meta = fs::metadata(path).ok();
    Entry::file(
        name,
        meta.as_ref().map_or(0, |m| m.len()),
        meta.as_ref().map(host_mtime),
    )
}

/// Lists every entry of the image at `path`.
///
/// Never fails: a file that is not a supported image yields no entries, and
/// an image that cannot be parsed yields one entry describing the whole file.
/// Clearing `running` stops the walk (and any decompression ahead of it) at
/// the next directory; a cancelled listing yields no entries.
pub fn list(path: &Path, running: Arc<AtomicBool>) -> Vec<Entry> {
    let mut ignore = |_: u64| {};
    let mut task = Task::new(&running, &mut ignore);

    let attempt = detect(path).and_then(|kind| match kind {
        Some(kind) => {
            let image = decompress_image(path, &mut task)?;
            list_kind(kind, image.as_ref(), &mut task).map(Some)
        }
        None => Ok(None),
    });

    match attempt {
        Ok(Some(entries)) => entries,
        Ok(None) => Vec::new(),
        Err(ImageError::Cancelled) => {
            info!(path = %path.display(), "listing cancelled");
            Vec::new()
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "listing failed; reporting image as opaque");
            vec![opaque_entry(path)]
        }
    }
}

/// Extracts the image at `path` into `out_dir`: everything, or just the
/// `/`-delimited `entry` (a file or a whole directory subtree).
///
/// Files written before a failure are left in place.
///
/// # Arguments
///
/// * `running` - Cleared by the caller to cancel the extraction.
/// * `on_progress` - Called with the total number of bytes written so far.
pub fn extract<F>(
    path: &Path,
    out_dir: &Path,
    entry: Option<&str>,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64),
{
    let mut task = Task::new(&running, &mut on_progress);
    let kind = detect(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .ok_or(ImageError::BadSignature("supported disk"))
        .with_context(|| format!("cannot extract {}", path.display()))?;

    let result = (|| -> Result<()> {
        let image = decompress_image(path, &mut task)?;
        match effective_kind(kind, image.as_ref())? {
            ContainerKind::Iso => {
                IsoImage::open(image.as_ref())?.extract(out_dir, entry, &mut task)
            }
            ContainerKind::FatImage | ContainerKind::Qcow2 => {
                let dev = BlockDevice::open(image.as_ref(), false)?;
                FatVolume::open(dev)?.extract(out_dir, entry, &mut task)
            }
        }
    })();
    result.with_context(|| format!("failed to extract {}", path.display()))?;

    info!(
        image = %path.display(),
        out = %out_dir.display(),
        entry = entry.unwrap_or("/"),
        "extraction complete"
    );
    Ok(())
}

/// Removes a half-written output after a failed or cancelled authoring run.
fn finish_authoring(output: &Path, result: Result<()>) -> anyhow::Result<()> {
    if let Err(err) = result {
        if let Err(rm_err) = fs::remove_file(output) {
            if rm_err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %output.display(), %rm_err, "could not remove incomplete image");
            }
        }
        return Err(err).with_context(|| format!("failed to create {}", output.display()));
    }
    info!(path = %output.display(), "image created");
    Ok(())
}

fn checked_size(size_mb: u64) -> Result<u64> {
    if size_mb == 0 || size_mb > MAX_IMAGE_MB {
        return Err(ImageError::InvalidConfig(format!(
            "image size must be between 1 and {MAX_IMAGE_MB} MiB, got {size_mb}"
        )));
    }
    Ok(size_mb * 1024 * 1024)
}

/// Imports `source` (if any) onto a freshly formatted device and closes it.
/// `output` is the image file itself and is never imported.
fn populate(
    dev: BlockDevice,
    source: Option<&Path>,
    output: &Path,
    task: &mut Task<'_>,
) -> Result<()> {
    match source {
        Some(source) => {
            let mut volume = FatVolume::open(dev)?;
            volume.import_tree(source, output, task)?;
            volume.close()
        }
        None => dev.close(),
    }
}

/// Authors an ISO 9660 image of the directory `source`.
pub fn create_iso<F>(
    source: &Path,
    output: &Path,
    label: &str,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64),
{
    let mut task = Task::new(&running, &mut on_progress);
    let result = iso::create_iso(source, output, label, &mut task);
    finish_authoring(output, result)
}

/// Authors a raw FAT image of `size_mb` MiB, optionally filled from `source`.
pub fn create_img<F>(
    source: Option<&Path>,
    output: &Path,
    size_mb: u64,
    label: &str,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64),
{
    let mut task = Task::new(&running, &mut on_progress);
    let size = checked_size(size_mb)?;
    let result = (|| -> Result<()> {
        File::create(output)?.set_len(size)?;
        let mut dev = BlockDevice::open(output, true)?;
        fat::format(&mut dev, label)?;
        populate(dev, source, output, &mut task)
    })();
    finish_authoring(output, result)
}

/// Authors a qcow2 disk of `size_mb` MiB holding a FAT volume, optionally
/// filled from `source`.
pub fn create_qcow2<F>(
    source: Option<&Path>,
    output: &Path,
    size_mb: u64,
    label: &str,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64),
{
    let mut task = Task::new(&running, &mut on_progress);
    checked_size(size_mb)?;
    let result = vdisk::create_qcow2(output, size_mb, label)
        .and_then(|dev| populate(dev, source, output, &mut task));
    finish_authoring(output, result)
}

/// Listing results keyed by absolute container path.
#[derive(Debug, Default)]
pub struct ListingCache {
    entries: HashMap<PathBuf, Vec<Entry>>,
}

impl ListingCache {
    fn key(path: &Path) -> PathBuf {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn get(&self, path: &Path) -> Option<&[Entry]> {
        self.entries.get(&Self::key(path)).map(Vec::as_slice)
    }

    pub fn insert(&mut self, path: &Path, entries: Vec<Entry>) {
        self.entries.insert(Self::key(path), entries);
    }

    /// Drops the entry for `path` and for anything below it.
    pub fn invalidate(&mut self, path: &Path) {
        let key = Self::key(path);
        self.entries.retain(|cached, _| !cached.starts_with(&key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache-aware front door to the container operations.
#[derive(Debug, Default)]
pub struct Containers {
    cache: ListingCache,
}

impl Containers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    /// Like [`list`], served from the cache when possible. Cancelled
    /// listings are not cached.
    pub fn list(&mut self, path: &Path, running: Arc<AtomicBool>) -> Vec<Entry> {
        if let Some(entries) = self.cache.get(path) {
            return entries.to_vec();
        }
        let entries = list(path, running.clone());
        if running.load(Ordering::SeqCst) {
            self.cache.insert(path, entries.clone());
        }
        entries
    }

    /// Direct children of the directory `sub` inside the image, with paths
    /// relative to `sub`.
    pub fn list_directory(
        &mut self,
        path: &Path,
        sub: &str,
        running: Arc<AtomicBool>,
    ) -> Vec<Entry> {
        let prefix = path_components(sub).join("/");
        self.list(path, running)
            .into_iter()
            .filter_map(|mut e| {
                let rest = if prefix.is_empty() {
                    e.path.clone()
                } else {
                    let (head, tail) = e.path.split_at_checked(prefix.len())?;
                    if !head.eq_ignore_ascii_case(&prefix) {
                        return None;
                    }
                    tail.strip_prefix('/')?.to_string()
                };
                if rest.is_empty() || rest.contains('/') {
                    return None;
                }
                e.path = rest;
                Some(e)
            })
            .collect()
    }

    pub fn extract<F>(
        &mut self,
        path: &Path,
        out_dir: &Path,
        entry: Option<&str>,
        running: Arc<AtomicBool>,
        on_progress: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(u64),
    {
        let result = extract(path, out_dir, entry, running, on_progress);
        self.cache.invalidate(out_dir);
        result
    }

    pub fn create_iso<F>(
        &mut self,
        source: &Path,
        output: &Path,
        label: &str,
        running: Arc<AtomicBool>,
        on_progress: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(u64),
    {
        let result = create_iso(source, output, label, running, on_progress);
        self.cache.invalidate(output);
        result
    }

    pub fn create_img<F>(
        &mut self,
        source: Option<&Path>,
        output: &Path,
        size_mb: u64,
        label: &str,
        running: Arc<AtomicBool>,
        on_progress: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(u64),
    {
        let result = create_img(source, output, size_mb, label, running, on_progress);
        self.cache.invalidate(output);
        result
    }

    pub fn create_qcow2<F>(
        &mut self,
        source: Option<&Path>,
        output: &Path,
        size_mb: u64,
        label: &str,
        running: Arc<AtomicBool>,
        on_progress: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(u64),
    {
        let result = create_qcow2(source, output, size_mb, label, running, on_progress);
        self.cache.invalidate(output);
        result
    }

    /// Deletes a file or directory tree on the host.
    pub fn delete(&mut self, path: &Path) -> anyhow::Result<()> {
        self.cache.invalidate(path);
        let result = if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.with_context(|| format!("failed to delete {}", path.display()))
    }

    pub fn rename(&mut self, from: &Path, to: &Path) -> anyhow::Result<()> {
        self.cache.invalidate(from);
        self.cache.invalidate(to);
        fs::rename(from, to)
            .with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))
    }

    /// Forgets cached listings for `path`, e.g. after writing it elsewhere.
    pub fn invalidate(&mut self, path: &Path) {
        self.cache.invalidate(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sniffs_signatures() {
        let mut head = vec![0u8; SNIFF_LEN];
        assert_eq!(sniff(&head, "img"), None);

        head[510] = 0x55;
        head[511] = 0xAA;
        assert_eq!(sniff(&head, "img"), Some(ContainerKind::FatImage));

        head[ISO_SIGNATURE_OFFSET..SNIFF_LEN].copy_from_slice(b"CD001");
        assert_eq!(sniff(&head, "iso"), Some(ContainerKind::Iso));
        assert_eq!(sniff(&head, "img"), Some(ContainerKind::FatImage));

        head[..4].copy_from_slice(&QCOW2_MAGIC);
        assert_eq!(sniff(&head, "iso"), Some(ContainerKind::Qcow2));

        assert_eq!(sniff(&[0x55; 100], "img"), None);
    }

    #[test]
    fn non_images_list_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"just text").unwrap();
        assert!(!is_disk_image(&path));
        assert!(list(&path, Arc::new(AtomicBool::new(true))).is_empty());
    }

    #[test]
    fn cache_is_invalidated_by_mutations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        let running = Arc::new(AtomicBool::new(true));
        let mut containers = Containers::new();

        containers
            .create_img(None, &path, 2, "CACHE", running.clone(), |_| {})
            .unwrap();
        assert!(containers.list(&path, running.clone()).is_empty());
        assert_eq!(containers.cache().len(), 1);

        let moved = dir.path().join("moved.img");
        containers.rename(&path, &moved).unwrap();
        assert!(containers.cache().is_empty());

        containers.list(&moved, running.clone());
        containers.delete(&moved).unwrap();
        assert!(containers.cache().is_empty());
        assert!(!moved.exists());
    }

    #[test]
    fn invalid_sizes_are_rejected_without_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.img");
        let running = Arc::new(AtomicBool::new(true));
        let err = create_img(None, &path, 0, "X", running, |_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::InvalidConfig(_))
        ));
        assert!(!path.exists());
    }
}
