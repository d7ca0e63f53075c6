//! The seams between the builder core and its collaborators.
//!
//! The core never parses Mach-O itself: it consumes images through
//! [`MachImage`], maps inputs through [`FileSystem`], and hands rewritten
//! segments to an external [`ImageAdjuster`]. Production implementations
//! live in [`crate::macho_analyzer`] and [`crate::filesystem`]; tests supply
//! synthetic ones.

use crate::cache_format::VmProt;
use crate::diagnostics::Diagnostics;

/// One segment of an input image, as reported by the analyzer.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub name: String,
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_size: u64,
    /// Bytes actually covered by sections; the tail up to `vm_size` is
    /// zero-fill and is not copied.
    pub size_of_sections: u64,
    pub p2align: u8,
    pub protections: VmProt,
    /// Ordinal of the segment in the image's load commands.
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct DependentDylib {
    pub path: String,
    pub weak: bool,
    pub re_export: bool,
    pub upward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachFileKind {
    Dylib,
    Bundle,
    DynamicExecutable,
    Other,
}

/// Narrow analyzer interface over one mapped image.
///
/// `Send + Sync` because segment copy and per-image adjustment fan out over
/// a thread pool.
pub trait MachImage: Send + Sync {
    /// The mapped bytes of the selected slice. Segment source ranges index
    /// into this.
    fn bytes(&self) -> &[u8];

    fn file_kind(&self) -> MachFileKind;

    fn install_name(&self) -> Option<&str>;

    fn uuid(&self) -> [u8; 16];

    fn segments(&self) -> Vec<SegmentInfo>;

    fn dependents(&self) -> Vec<DependentDylib>;

    /// Content of `segment,section`, if present.
    fn section_bytes(&self, segment: &str, section: &str) -> Option<&[u8]>;

    /// `Err(reason)` when the image is structurally unfit for cache
    /// placement (it is then demoted to an ordinary dylib).
    fn placeable_in_cache(&self) -> Result<(), String>;
}

/// A file the [`FileSystem`] provider mapped for the requested architecture.
pub struct LoadedFile {
    pub image: Box<dyn MachImage>,
    /// Offset of the selected slice within the (possibly fat) file.
    pub slice_offset: u64,
    pub mtime: u64,
    pub inode: u64,
}

/// Read-only view of the input tree.
pub trait FileSystem {
    fn load(&self, path: &str, arch_name: &str) -> Result<LoadedFile, String>;

    /// `(exists, is_setuid)`.
    fn file_exists(&self, path: &str) -> (bool, bool);
}

/// One placed segment handed to the adjuster: destination bytes plus the
/// addresses the core assigned.
pub struct PlacedSegment<'a> {
    pub name: &'a str,
    pub source_index: u32,
    pub unslid_address: u64,
    pub cache_file_offset: u64,
    pub bytes: &'a mut [u8],
}

/// Everything the external adjuster needs to rewrite one image's
/// intra-image references for its new addresses.
pub struct ImageToAdjust<'a> {
    pub runtime_path: &'a str,
    /// The original mapped image, for reading LINKEDIT info that was not
    /// copied.
    pub source: &'a [u8],
    /// Placed segments in original load-command order.
    pub segments: Vec<PlacedSegment<'a>>,
}

/// External collaborator that rewrites each image's rebases/fixup metadata
/// in place once the core has assigned addresses.
pub trait ImageAdjuster: Sync {
    fn adjust_image(&self, image: &mut ImageToAdjust<'_>, diag: &mut Diagnostics);
}

/// External collaborator performing the FIPS text-section HMAC; hashing
/// itself is outside the core.
pub trait TextSealer {
    /// Compute the seal over `text` into `hash_store` (32 bytes).
    fn seal(&self, text: &[u8], hash_store: &mut [u8]);
}
