//! Transparent handling of `.gz`, `.xz` and `.zst` wrapped images.
use crate::error::Result;
use crate::task::Task;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn is_compressed_ext(ext: &str) -> bool {
    matches!(ext, "gz" | "gzip" | "xz" | "zst" | "zstd")
}

/// Lower-cased extension of the image itself, looking through one
/// compression suffix: `disk.img.xz` gives `img`.
pub(crate) fn inner_extension(path: &Path) -> String {
    let ext = extension_of(path);
    if is_compressed_ext(&ext) {
        path.file_stem()
            .map(|stem| extension_of(Path::new(stem)))
            .unwrap_or_default()
    } else {
        ext
    }
}

/// Opens `path` as a stream of image bytes, decompressing on the fly, or
/// `None` when the file is not compressed.
fn open_decoder(path: &Path) -> Result<Option<Box<dyn Read>>> {
    let input = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match extension_of(path).as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(input)),
        "xz" => Box::new(XzDecoder::new(input)),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(input)?),
        _ => return Ok(None),
    };
    Ok(Some(reader))
}

/// Reads up to `len` leading bytes of the (decompressed) image.
pub(crate) fn read_head(path: &Path, len: usize) -> Result<Vec<u8>> {
    let reader: Box<dyn Read> = match open_decoder(path)? {
        Some(decoder) => decoder,
        None => Box::new(File::open(path)?),
    };
    let mut head = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut head)?;
    Ok(head)
}

/// An image ready for random access. If the source was compressed this
/// holds the temporary file, which is deleted on drop.
pub(crate) struct DecompressedImage {
    path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl AsRef<Path> for DecompressedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Decompresses `input` to a temporary file if it is compressed.
pub(crate) fn decompress_image(input: &Path, task: &mut Task<'_>) -> Result<DecompressedImage> {
    let Some(mut reader) = open_decoder(input)? else {
        return Ok(DecompressedImage {
            path: input.to_path_buf(),
            _temp_handle: None,
        });
    };

    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            task.check()?;
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            task.advance(n as u64);
        }
        writer.flush()?;
    }

    let temp_path = temp_file.into_temp_path();
    debug!(source = %input.display(), temp = %temp_path.display(), "decompressed image");
    Ok(DecompressedImage {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::detached;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    #[test]
    fn inner_extension_looks_through_compression() {
        assert_eq!(inner_extension(Path::new("disk.IMG")), "img");
        assert_eq!(inner_extension(Path::new("disk.img.xz")), "img");
        assert_eq!(inner_extension(Path::new("cd.iso.gz")), "iso");
        assert_eq!(inner_extension(Path::new("blob.zst")), "");
    }

    #[test]
    fn gzip_images_are_decompressed_to_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.img.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(&[0xAB; 4096]).unwrap();
        enc.finish().unwrap();

        assert_eq!(read_head(&path, 4).unwrap(), vec![0xAB; 4]);
        let image = detached(|task| decompress_image(&path, task)).unwrap();
        let temp: PathBuf = AsRef::<Path>::as_ref(&image).to_path_buf();
        assert_ne!(temp, path);
        assert_eq!(std::fs::read(&temp).unwrap(), vec![0xAB; 4096]);

        drop(image);
        assert!(!temp.exists());
    }
}
