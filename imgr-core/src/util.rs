use crate::error::{ImageError, Result};
use crate::task::Task;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

// Use a 1 MiB buffer for bulk copies.
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Joins a name read from an image onto a host directory.
///
/// Names come from untrusted on-disk bytes, so anything that is not a single
/// normal path component is rejected.
pub(crate) fn safe_join(dir: &Path, name: &str) -> Result<PathBuf> {
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(dir.join(name)),
        _ => Err(ImageError::corrupt(format!("unsafe entry name {name:?}"))),
    }
}

/// Splits a `/`-delimited entry path into its non-empty components.
pub(crate) fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

pub(crate) fn join_entry_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Returns `true` if `candidate` is the file at `output`, however either
/// path is spelled.
pub(crate) fn is_same_file(candidate: &Path, output: &Path) -> bool {
    if candidate == output {
        return true;
    }
    if candidate.file_name() != output.file_name() {
        return false;
    }
    match (candidate.canonicalize(), output.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Copies exactly `len` bytes from `reader` to `out`, zero-filling if the
/// source runs short. Checks for cancellation between chunks.
pub(crate) fn copy_exact(
    reader: &mut impl Read,
    mut len: u64,
    out: &mut impl Write,
    task: &mut Task<'_>,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    while len > 0 {
        task.check()?;
        let want = len.min(buf.len() as u64) as usize;
        let mut n = reader.read(&mut buf[..want])?;
        if n == 0 {
            buf[..want].fill(0);
            n = want;
        }
        out.write_all(&buf[..n])?;
        len -= n as u64;
        task.advance(n as u64);
    }
    Ok(())
}

pub(crate) fn host_mtime(meta: &std::fs::Metadata) -> OffsetDateTime {
    meta.modified()
        .map(OffsetDateTime::from)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub(crate) fn system_time(t: Option<OffsetDateTime>) -> Option<SystemTime> {
    t.map(SystemTime::from)
}

/// Builds a timestamp from calendar fields, returning `None` for any field
/// out of range.
pub(crate) fn calendar_time(
    year: i32,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    offset_minutes: i32,
) -> Option<OffsetDateTime> {
    let month = Month::try_from(month).ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    let offset = UtcOffset::from_whole_seconds(offset_minutes * 60).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_offset(offset))
}
