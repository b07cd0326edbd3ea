//! The core, UI-agnostic library for the `imgr` disk image utility.
//!
//! `imgr-core` reads, extracts and authors ISO 9660 images, FAT12/16/32
//! volume images and qcow2 virtual disks holding a FAT volume, without
//! mounting anything. It is meant to be driven by any front-end, whether a
//! command-line interface (like `imgr`) or a file browser.
//!
//! The library is structured into several key modules:
//! - [`container`]: Format detection and the list/extract/create entry points,
//!   plus the cache-aware [`Containers`] facade.
//! - [`vdisk`]: The virtual block device, either a raw file or a qcow2
//!   translator, and qcow2 authoring.
//! - [`fat`]: The FAT file system driver, working through a [`vdisk::BlockDevice`].
//! - [`iso`]: The ISO 9660 reader and authoring.
//! - [`endian`]: Little-, big- and both-endian field helpers.
//!
//! Long operations take a shared cancellation flag and report their progress
//! via callbacks, allowing the calling application to display progress in any
//! way it chooses.
//!
//! ## Example: Listing and Extracting an Image
//!
//! ```rust,no_run
//! use imgr_core::container;
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let image = Path::new("path/to/disk.img.xz");
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     // Listing never fails; unreadable images show up as one opaque entry.
//!     for entry in container::list(image, running.clone()) {
//!         println!("{entry}");
//!     }
//!
//!     container::extract(
//!         image,
//!         Path::new("out"),
//!         Some("docs/readme.txt"),
//!         running.clone(),
//!         |bytes| println!("{bytes} bytes extracted"),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

pub mod container;
mod decompress;
pub mod endian;
mod entry;
pub mod error;
pub mod fat;
pub mod iso;
mod task;
mod util;
pub mod vdisk;

pub use container::{ContainerKind, Containers, ListingCache};
pub use entry::Entry;
pub use error::{ImageError, Result};

/// Cap on entries collected by one listing or extraction.
pub const MAX_ENTRIES: usize = 10_000;
/// Cap on directory nesting followed by walks over images and host trees.
pub const MAX_DEPTH: usize = 64;
