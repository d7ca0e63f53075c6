//! Production [`FileSystem`] provider: memory-maps input files and parses
//! them with the goblin-backed analyzer.

use std::fs::File;
use std::ops::Deref;

use crate::images::{FileSystem, LoadedFile};
use crate::macho_analyzer::MachAnalyzer;

/// Bytes backing a loaded image: a file mapping in production, an owned
/// buffer in tests.
pub enum FileBytes {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Owned(vec) => vec,
        }
    }
}

impl std::fmt::Debug for FileBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileBytes::Mapped(map) => write!(f, "FileBytes::Mapped({} bytes)", map.len()),
            FileBytes::Owned(vec) => write!(f, "FileBytes::Owned({} bytes)", vec.len()),
        }
    }
}

/// Maps files straight off the local disk.
#[derive(Debug, Default)]
pub struct DiskFileSystem;

impl FileSystem for DiskFileSystem {
    fn load(&self, path: &str, arch_name: &str) -> Result<LoadedFile, String> {
        let file = File::open(path).map_err(|e| format!("could not open '{path}': {e}"))?;
        let meta = file
            .metadata()
            .map_err(|e| format!("could not stat '{path}': {e}"))?;
        let (mtime, inode) = file_identity(&meta);

        // SAFETY: the input tree is read-only for the duration of the build.
        let map = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| format!("could not map '{path}': {e}"))?;

        let image = MachAnalyzer::parse(FileBytes::Mapped(map), arch_name)?;
        let slice_offset = image.slice_offset();
        Ok(LoadedFile {
            image: Box::new(image),
            slice_offset,
            mtime,
            inode,
        })
    }

    fn file_exists(&self, path: &str) -> (bool, bool) {
        match std::fs::metadata(path) {
            Ok(meta) => (true, is_setuid(&meta)),
            Err(_) => (false, false),
        }
    }
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.mtime() as u64, meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> (u64, u64) {
    (0, 0)
}

#[cfg(unix)]
fn is_setuid(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o4000 != 0
}

#[cfg(not(unix))]
fn is_setuid(_meta: &std::fs::Metadata) -> bool {
    false
}
