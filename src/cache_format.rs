//! On-disk structures of the cache file.
//!
//! These mirror the loader's view of the cache byte for byte. All multi-byte
//! fields are host-endian (the cache is produced on and for little-endian
//! machines); code-signature blobs are the exception and use big-endian
//! fields, see [`crate::code_signer`].

use std::mem::size_of;

/// First bytes of the header: `"dyld_v1"` padded with spaces to 15 bytes,
/// then the architecture name, NUL padded to 16.
pub const CACHE_MAGIC_PREFIX: &str = "dyld_v1";

/// Closure format version recorded in the header.
pub const CACHE_FORMAT_VERSION: u32 = 10;

pub const CACHE_TYPE_DEVELOPMENT: u64 = 0;
pub const CACHE_TYPE_PRODUCTION: u64 = 1;

/// Page granularity of slide info and code signing.
pub const PAGE_SIZE: u64 = 4096;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheHeader {
    pub magic: [u8; 16],            /* e.g. "dyld_v1    i386" */
    pub mapping_offset: u32,        /* file offset to first CacheMappingInfo */
    pub mapping_count: u32,         /* number of CacheMappingInfo entries */
    pub images_offset: u32,         /* file offset to first CacheImageInfo */
    pub images_count: u32,          /* number of CacheImageInfo entries */
    pub dyld_base_address: u64,     /* base address of dyld when cache was built */
    pub code_signature_offset: u64, /* file offset of code signature blob */
    pub code_signature_size: u64,   /* size of code signature blob (zero means to end of file) */
    pub slide_info_offset: u64,     /* file offset of kernel slid info */
    pub slide_info_size: u64,       /* size of kernel slid info */
    pub local_symbols_offset: u64,  /* file offset of where local symbols are stored */
    pub local_symbols_size: u64,    /* size of local symbols information */
    pub uuid: [u8; 16],             /* unique value for each shared cache file */
    pub cache_type: u64,            /* 0 for development, 1 for production */
    pub branch_pools_offset: u32,   /* file offset to table of uint64_t pool addresses */
    pub branch_pools_count: u32,    /* number of uint64_t entries */
    pub accelerate_info_addr: u64,  /* (unslid) address of optimization info */
    pub accelerate_info_size: u64,  /* size of optimization info */
    pub images_text_offset: u64,    /* file offset to first CacheImageTextInfo */
    pub images_text_count: u64,     /* number of CacheImageTextInfo entries */
    pub dylibs_image_group_addr: u64, /* legacy, zero */
    pub dylibs_image_group_size: u64, /* legacy, zero */
    pub other_image_group_addr: u64,  /* legacy, zero */
    pub other_image_group_size: u64,  /* legacy, zero */
    pub prog_closures_addr: u64,    /* (unslid) address of list of program launch closures */
    pub prog_closures_size: u64,    /* size of list of program launch closures */
    pub prog_closures_trie_addr: u64, /* (unslid) address of trie of indexes into program launch closures */
    pub prog_closures_trie_size: u64, /* size of trie of indexes into program launch closures */
    pub platform: u8,               /* platform number (macOS=1, etc) */
    pub dylibs_expected_on_disk: u8,
    pub simulator: u8,
    pub locally_built_cache: u8,
    pub format_version: u32,        /* launch closure binary format version */
    pub shared_region_start: u64,   /* base load address of cache if not slid */
    pub shared_region_size: u64,    /* overall size of region cache can be mapped into */
    pub max_slide: u64,             /* runtime slide of cache can be between zero and this value */
}

bitflags::bitflags! {
    /// VM protection bits, as recorded in each mapping record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheMappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheImageTextInfo {
    pub uuid: [u8; 16],
    pub load_address: u64, /* unslid address of start of __TEXT */
    pub text_segment_size: u32,
    pub path_offset: u32, /* file offset of install name string */
}

/// Fixed header of slide info versions 2 and 4; `u16` page starts and page
/// extras arrays follow at the recorded offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheSlideInfo2 {
    pub version: u32, /* 2 or 4 */
    pub page_size: u32,
    pub page_starts_offset: u32,
    pub page_starts_count: u32,
    pub page_extras_offset: u32,
    pub page_extras_count: u32,
    pub delta_mask: u64, /* which (contiguous) set of bits contains the delta to the next rebase location */
    pub value_add: u64,  /* base address of cache for 32-bit archs, zero for 64-bit */
}

/* value of a page start/extra when the page has nothing to rebase */
pub const SLIDE_PAGE_ATTR_NO_REBASE: u16 = 0x4000;
/* page start is an index into the extras table */
pub const SLIDE_PAGE_ATTR_EXTRA: u16 = 0x8000;
/* last chain entry for a page in the extras table */
pub const SLIDE_PAGE_ATTR_END: u16 = 0x8000;
/* v2 extras indexes are 14-bit */
pub const SLIDE_PAGE_EXTRAS_MAX: usize = 0x3FFF;

pub const SLIDE4_PAGE_NO_REBASE: u16 = 0xFFFF;
pub const SLIDE4_PAGE_USE_EXTRA: u16 = 0x8000;
pub const SLIDE4_PAGE_EXTRA_END: u16 = 0x8000;
/* v4 page starts/extras hold a 15-bit index */
pub const SLIDE4_PAGE_INDEX: usize = 0x7FFF;

/// Fixed header of slide info version 3 (pointer-authentication archs);
/// `page_starts_count` `u16`s follow.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheSlideInfo3 {
    pub version: u32, /* 3 */
    pub page_size: u32,
    pub page_starts_count: u32,
    pub auth_value_add: u64,
}

pub const SLIDE_V3_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;

// Code-signature blob constants, from the kernel's cs_blobs.h. All fields of
// the blobs themselves are written big-endian.
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

pub const CSSLOT_CODEDIRECTORY: u32 = 0;
pub const CSSLOT_REQUIREMENTS: u32 = 2;
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
pub const CSSLOT_CMS_SIGNATURE: u32 = 0x10000;

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_HASH_SIZE_SHA1: usize = 20;
pub const CS_HASH_SIZE_SHA256: usize = 32;

/* supports exec segment */
pub const CS_CODEDIRECTORY_VERSION: u32 = 0x20400;
pub const CS_SIGNATURE_ADHOC: u32 = 0x2;

/// Byte offsets of the code-directory fields, through the exec-segment
/// extension (the identifier string starts at `CS_CD_SIZE`).
pub const CS_CD_MAGIC: usize = 0;
pub const CS_CD_LENGTH: usize = 4;
pub const CS_CD_VERSION: usize = 8;
pub const CS_CD_FLAGS: usize = 12;
pub const CS_CD_HASH_OFFSET: usize = 16;
pub const CS_CD_IDENT_OFFSET: usize = 20;
pub const CS_CD_N_SPECIAL_SLOTS: usize = 24;
pub const CS_CD_N_CODE_SLOTS: usize = 28;
pub const CS_CD_CODE_LIMIT: usize = 32;
pub const CS_CD_HASH_SIZE: usize = 36;
pub const CS_CD_HASH_TYPE: usize = 37;
pub const CS_CD_PLATFORM: usize = 38;
pub const CS_CD_PAGE_SIZE: usize = 39;
pub const CS_CD_SPARE2: usize = 40;
pub const CS_CD_SCATTER_OFFSET: usize = 44;
pub const CS_CD_TEAM_OFFSET: usize = 48;
pub const CS_CD_SPARE3: usize = 52;
pub const CS_CD_CODE_LIMIT_64: usize = 56;
pub const CS_CD_EXEC_SEG_BASE: usize = 64;
pub const CS_CD_EXEC_SEG_LIMIT: usize = 72;
pub const CS_CD_EXEC_SEG_FLAGS: usize = 80;
/// `offsetof(CS_CodeDirectory, end_withExecSeg)`
pub const CS_CD_SIZE: usize = 88;

/// SuperBlob: `{magic, length, count}` then `count` `{type, offset}` pairs.
pub const CS_SUPERBLOB_SIZE: usize = 12;
pub const CS_BLOB_INDEX_SIZE: usize = 8;
/// Generic blob header `{magic, length}` (the empty CMS wrapper is exactly
/// this).
pub const CS_BLOB_SIZE: usize = 8;
/// Empty requirements blob: `{magic, length, data = 0}`.
pub const CS_REQUIREMENTS_SIZE: usize = 12;

/// Byte view of a wire struct for copying into the cache buffer.
pub(crate) fn struct_bytes<T: Sized>(val: &T) -> &[u8] {
    // SAFETY: only used on the #[repr(C)] wire structs above, which have no
    // padding-free requirement for reading back; we only ever copy out.
    unsafe { std::slice::from_raw_parts((val as *const T).cast::<u8>(), size_of::<T>()) }
}

/// Copy a wire struct out of a cache buffer. Returns `None` when the buffer
/// is too small.
pub fn read_struct<T: Sized + Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    if bytes.len() < offset.checked_add(size_of::<T>())? {
        return None;
    }
    // SAFETY: bounds checked above; T is a plain-data wire struct.
    Some(unsafe { bytes.as_ptr().add(offset).cast::<T>().read_unaligned() })
}

impl CacheHeader {
    pub fn read_from(bytes: &[u8]) -> Option<CacheHeader> {
        let header: CacheHeader = read_struct(bytes, 0)?;
        if !header.magic.starts_with(CACHE_MAGIC_PREFIX.as_bytes()) {
            return None;
        }
        Some(header)
    }

    /// The mapping records following the header.
    pub fn mappings(&self, bytes: &[u8]) -> Option<Vec<CacheMappingInfo>> {
        (0..self.mapping_count as usize)
            .map(|i| {
                read_struct(
                    bytes,
                    self.mapping_offset as usize + i * size_of::<CacheMappingInfo>(),
                )
            })
            .collect()
    }

    pub fn images(&self, bytes: &[u8]) -> Option<Vec<CacheImageInfo>> {
        (0..self.images_count as usize)
            .map(|i| {
                read_struct(
                    bytes,
                    self.images_offset as usize + i * size_of::<CacheImageInfo>(),
                )
            })
            .collect()
    }

    pub fn images_text(&self, bytes: &[u8]) -> Option<Vec<CacheImageTextInfo>> {
        (0..self.images_text_count as usize)
            .map(|i| {
                read_struct(
                    bytes,
                    self.images_text_offset as usize + i * size_of::<CacheImageTextInfo>(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn struct_sizes() {
        // The loader hardcodes these; a change here is a format break.
        assert_eq!(size_of::<CacheMappingInfo>(), 32);
        assert_eq!(size_of::<CacheImageInfo>(), 32);
        assert_eq!(size_of::<CacheImageTextInfo>(), 32);
        assert_eq!(size_of::<CacheSlideInfo2>(), 40);
        assert_eq!(size_of::<CacheSlideInfo3>(), 24);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let mut header = CacheHeader::default();
        header.magic[..CACHE_MAGIC_PREFIX.len()].copy_from_slice(CACHE_MAGIC_PREFIX.as_bytes());
        header.mapping_count = 3;
        header.shared_region_start = 0x1_8000_0000;

        let bytes = struct_bytes(&header).to_vec();
        let back = CacheHeader::read_from(&bytes).unwrap();
        assert_eq!(back, header);
    }
}
