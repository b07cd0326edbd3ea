use std::fmt;
use time::OffsetDateTime;

/// One node seen while listing a container.
///
/// Entries are produced by the drivers in [`crate::fat`] and [`crate::iso`]
/// and normalized by [`crate::container`]; they are plain data and are never
/// mutated after being handed to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Slash-separated path relative to the container root (or to the
    /// directory being viewed).
    pub path: String,
    /// Whether this entry is a directory.
    pub is_directory: bool,
    /// File size in bytes; always 0 for directories.
    pub size: u64,
    /// Best-effort modification time. `None` when the format stores no usable
    /// timestamp.
    pub modified: Option<OffsetDateTime>,
}

impl Entry {
    pub(crate) fn file(path: String, size: u64, modified: Option<OffsetDateTime>) -> Self {
        Self {
            path,
            is_directory: false,
            size,
            modified,
        }
    }

    pub(crate) fn directory(path: String, modified: Option<OffsetDateTime>) -> Self {
        Self {
            path,
            is_directory: true,
            size: 0,
            modified,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modified = match self.modified {
            Some(t) => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}",
                t.year(),
                u8::from(t.month()),
                t.day(),
                t.hour(),
                t.minute()
            ),
            None => "-".to_string(),
        };

        if self.is_directory {
            write!(f, "{:>12} {:<16} {}/", "<DIR>", modified, self.path)
        } else {
            write!(f, "{:>12} {:<16} {}", self.size, modified, self.path)
        }
    }
}
