//! The cache builder: assigns every segment of every admitted dylib a
//! cache-relative address, copies bytes, drives the external adjuster and
//! binder, encodes slide info, and signs the result.
//!
//! Phases run strictly in order; the first error recorded in the
//! diagnostics sink turns the remaining phases into no-ops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem::{offset_of, size_of};
use std::time::Instant;

use rayon::prelude::*;

use crate::arch::{ArchLayout, align};
use crate::aslr_tracker::AslrTracker;
use crate::cache_format::{
    CACHE_FORMAT_VERSION, CACHE_MAGIC_PREFIX, CACHE_TYPE_DEVELOPMENT, CACHE_TYPE_PRODUCTION,
    CacheHeader, CacheImageInfo, CacheImageTextInfo, CacheMappingInfo, CacheSlideInfo2,
    CacheSlideInfo3, PAGE_SIZE, VmProt, read_struct, struct_bytes,
};
use crate::code_signer::{CodeSignature, RegionsToSign, SignatureLayout, SigningDigestMode};
use crate::diagnostics::Diagnostics;
use crate::errors::BuildError;
use crate::fixups::{CacheBinder, CachedDylibInfo, FixupOrchestrator, PatchTable};
use crate::images::{FileSystem, ImageAdjuster, ImageToAdjust, PlacedSegment, TextSealer};
use crate::input_gatherer::{InputFile, LoadedImage, Platform, gather_inputs};
use crate::self_contained::verify_self_contained;
use crate::slide_info::{self, Pointer32, Pointer64};

/// A cache below this is a misconfigured input set, not a cache.
pub const MIN_CACHED_DYLIBS: usize = 30;

// The overflow estimate discounts the read-only region by the LINKEDIT
// share the downstream optimizer is expected to reclaim: with local
// symbols stripped LINKEDITs shrink to ~37% of their input size, otherwise
// to ~80%.
const LINKEDIT_SHARE_WITHOUT_LOCALS: u64 = 37;
const LINKEDIT_SHARE_WITH_LOCALS: u64 = 80;

// Per-region spans of the discontiguous (x86_64) layout.
const DISCONTIGUOUS_TEXT_SPAN: u64 = 0x6000_0000;
const DISCONTIGUOUS_DATA_SPAN: u64 = 0x4000_0000;
const DISCONTIGUOUS_RO_SPAN: u64 = 0x3FE0_0000;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub arch_name: String,
    pub platform: Platform,
    pub logging_prefix: String,
    /// Production caches have their stubs optimized away downstream; this
    /// also selects the recorded cache type.
    pub optimize_stubs: bool,
    pub code_signing_digest_mode: SigningDigestMode,
    /// Mastered caches have their dylibs deleted from disk: image records
    /// then carry a path hash instead of mtime/inode.
    pub dylibs_removed_during_mastering: bool,
    pub cache_supports_aslr: bool,
    pub evict_leaf_dylibs_on_overflow: bool,
    pub exclude_local_symbols: bool,
    pub is_locally_built_cache: bool,
    pub for_simulator: bool,
    pub verbose: bool,
    /// Dylib layout priority by runtime path; ties break lexicographically.
    pub dylib_ordering: HashMap<String, u32>,
    /// `__DATA_DIRTY` placement priority by runtime path.
    pub dirty_data_segment_ordering: HashMap<String, u32>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            arch_name: "x86_64".into(),
            platform: Platform::MacOs,
            logging_prefix: String::new(),
            optimize_stubs: false,
            code_signing_digest_mode: SigningDigestMode::Sha256Only,
            dylibs_removed_during_mastering: false,
            cache_supports_aslr: true,
            evict_leaf_dylibs_on_overflow: false,
            exclude_local_symbols: false,
            is_locally_built_cache: false,
            for_simulator: false,
            verbose: false,
            dylib_ordering: HashMap::new(),
            dirty_data_segment_ordering: HashMap::new(),
        }
    }
}

/// A symlink under which an admitted dylib is also reachable. Alias image
/// records are a legacy format feature and are not emitted; the list is
/// still handed to the binder.
#[derive(Debug, Clone)]
pub struct FileAlias {
    pub real_path: String,
    pub alias_path: String,
}

/// The external collaborators a build consumes. Any that are absent have
/// their phase skipped, which is only useful in tests.
#[derive(Default)]
pub struct Collaborators<'a> {
    pub adjuster: Option<&'a dyn ImageAdjuster>,
    pub binder: Option<&'a dyn CacheBinder>,
    pub fips_sealer: Option<&'a dyn TextSealer>,
}

/// One contiguous stretch of the output file.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Region {
    pub arena_offset: u64,
    pub buffer_size: u64,
    pub size_in_use: u64,
    pub unslid_load_address: u64,
    pub cache_file_offset: u64,
}

/// Where one source segment lands in the cache.
#[derive(Debug, Clone)]
pub(crate) struct SegmentMappingInfo {
    pub src_segment_index: u32,
    pub seg_name: String,
    /// Copy source offset within the image's mapped bytes.
    pub src_offset: usize,
    pub dst_arena_offset: u64,
    pub dst_unslid_address: u64,
    pub dst_file_offset: u64,
    pub dst_segment_size: u64,
    pub copy_size: u64,
}

pub(crate) struct DylibInfo {
    pub image: LoadedImage,
    pub cache_location: Vec<SegmentMappingInfo>,
}

pub struct CacheBuilder {
    options: CreateOptions,
    diagnostics: Diagnostics,
    arch_layout: Option<&'static ArchLayout>,
    pub(crate) arena: Vec<u8>,
    pub(crate) sorted_dylibs: Vec<DylibInfo>,
    pub(crate) read_execute_region: Region,
    pub(crate) read_write_region: Region,
    pub(crate) read_only_region: Region,
    pub(crate) local_symbols_region: Region,
    pub(crate) code_signature: Option<CodeSignature>,
    branch_pool_starts: Vec<u64>,
    slide_info_file_offset: u64,
    slide_info_size_allocated: u64,
    aslr_tracker: AslrTracker,
    patch_table: PatchTable,
    missing_weak_imports: BTreeMap<u64, String>,
    evictions: BTreeSet<String>,
    alias_count: u32,
}

impl CacheBuilder {
    pub fn new(options: CreateOptions) -> CacheBuilder {
        let mut diagnostics = Diagnostics::new(options.logging_prefix.clone(), options.verbose);
        let arch_layout = ArchLayout::for_arch(&options.arch_name, options.for_simulator);
        if arch_layout.is_none() {
            diagnostics.error(BuildError::UnsupportedArchitecture(options.arch_name.clone()));
        }
        CacheBuilder {
            options,
            diagnostics,
            arch_layout,
            arena: Vec::new(),
            sorted_dylibs: Vec::new(),
            read_execute_region: Region::default(),
            read_write_region: Region::default(),
            read_only_region: Region::default(),
            local_symbols_region: Region::default(),
            code_signature: None,
            branch_pool_starts: Vec::new(),
            slide_info_file_offset: 0,
            slide_info_size_allocated: 0,
            aslr_tracker: AslrTracker::default(),
            patch_table: PatchTable::default(),
            missing_weak_imports: BTreeMap::new(),
            evictions: BTreeSet::new(),
            alias_count: 0,
        }
    }

    /// Empty on success, the first recorded error otherwise.
    pub fn error_message(&self) -> String {
        self.diagnostics.error_message()
    }

    pub fn warnings(&self) -> &[String] {
        self.diagnostics.warnings()
    }

    /// Install names of dylibs removed to recover from cache overflow.
    pub fn evictions(&self) -> &BTreeSet<String> {
        &self.evictions
    }

    pub fn agile_signature(&self) -> bool {
        self.options.code_signing_digest_mode == SigningDigestMode::Agile
    }

    pub fn cd_hash_first(&self) -> String {
        match &self.code_signature {
            Some(sig) => hex20(&sig.cd_hash_first),
            None => String::new(),
        }
    }

    pub fn cd_hash_second(&self) -> String {
        match &self.code_signature {
            Some(sig) => hex20(&sig.cd_hash_second),
            None => String::new(),
        }
    }

    /// The content-derived UUID, once signing has run.
    pub fn uuid(&self) -> [u8; 16] {
        match read_struct::<CacheHeader>(&self.arena, 0) {
            Some(header) => header.uuid,
            None => [0; 16],
        }
    }

    pub fn patch_table(&self) -> &PatchTable {
        &self.patch_table
    }

    /// Slots bound to missing weak imports, keyed by cache offset, with
    /// the library the import came from.
    pub fn missing_weak_imports(&self) -> &BTreeMap<u64, String> {
        &self.missing_weak_imports
    }

    /// Release the cache buffers without writing anything.
    pub fn delete_buffer(&mut self) {
        self.arena = Vec::new();
        self.code_signature = None;
    }

    pub(crate) fn diagnostics_have_error(&self) -> bool {
        self.diagnostics.has_error()
    }

    pub(crate) fn record_error(&mut self, err: BuildError) {
        self.diagnostics.error(err);
    }

    fn layout(&self) -> &'static ArchLayout {
        self.arch_layout.expect("arch layout checked before build")
    }

    fn aslr_enabled(&self) -> bool {
        self.options.cache_supports_aslr && self.layout().supports_aslr
    }

    /// Build from raw input files: classify, verify the dependency
    /// closure, report required binaries that fell out, then build.
    pub fn build_from_files(
        &mut self,
        file_system: &dyn FileSystem,
        inputs: &mut [InputFile],
        aliases: &[FileAlias],
        collaborators: &Collaborators<'_>,
    ) {
        if self.diagnostics.has_error() {
            return;
        }
        let arch_name = self.layout().arch_name;

        let mut classified = gather_inputs(file_system, arch_name, self.options.platform, inputs);
        verify_self_contained(&mut classified, inputs, true, &mut self.diagnostics);

        // A required binary that fell out of the cacheable set is fatal.
        for other in &classified.other_dylibs {
            let Some(index) = other.input else { continue };
            if !inputs[index].must_be_included() {
                continue;
            }
            let reason = inputs[index]
                .diag
                .warnings()
                .last()
                .cloned()
                .unwrap_or_else(|| "unknown error".to_owned());
            self.diagnostics.error(BuildError::DependencyMissing {
                path: inputs[index].path.clone(),
                reason,
            });
        }
        for &index in &classified.could_not_load {
            if !inputs[index].must_be_included() {
                continue;
            }
            let reason = inputs[index]
                .diag
                .warnings()
                .last()
                .cloned()
                .unwrap_or_else(|| "unknown error".to_owned());
            self.diagnostics.error(BuildError::DependencyMissing {
                path: inputs[index].path.clone(),
                reason,
            });
        }

        if !self.diagnostics.has_error() {
            self.build(classified.dylibs_to_cache, aliases, collaborators);
        }

        // Surface every input's accumulated warnings at the top level.
        for input in inputs {
            for warning in input.diag.warnings() {
                self.diagnostics.warning(warning.clone());
            }
        }
    }

    /// Build the cache from already-classified, admitted dylibs.
    pub fn build(
        &mut self,
        dylibs: Vec<LoadedImage>,
        aliases: &[FileAlias],
        collaborators: &Collaborators<'_>,
    ) {
        if self.diagnostics.has_error() {
            return;
        }
        if dylibs.len() < MIN_CACHED_DYLIBS {
            self.diagnostics.error(BuildError::TooFewDylibs(dylibs.len()));
            return;
        }
        let t_start = Instant::now();

        self.make_sorted_dylibs(dylibs);
        // Alias image records are legacy and never emitted.
        self.alias_count = 0;

        // Worst case: the whole shared region plus LINKEDIT slack.
        let allocated = (self.layout().shared_memory_size / 2 * 3) as usize;
        match allocate_zeroed(allocated) {
            Some(arena) => self.arena = arena,
            None => {
                self.diagnostics.error(BuildError::AllocationFailure);
                return;
            }
        }

        self.assign_segment_addresses();
        while self.cache_overflow_amount() != 0 {
            if !self.options.evict_leaf_dylibs_on_overflow {
                self.diagnostics.error(BuildError::CacheOverflow(
                    self.cache_overflow_amount() / 1024 / 1024,
                ));
                return;
            }
            let eviction_count = self.evict_leaf_dylibs(self.cache_overflow_amount());
            for dylib in &mut self.sorted_dylibs {
                dylib.cache_location.clear();
            }
            self.assign_segment_addresses();
            self.diagnostics
                .verbose(format!("cache overflow, evicted {eviction_count} leaf dylibs"));
        }

        let t_layout = Instant::now();
        self.write_cache_header();
        self.copy_raw_segments();

        let t_copy = Instant::now();
        self.aslr_tracker
            .set_data_region(self.read_write_region.size_in_use);
        self.adjust_all_images_for_new_segment_locations(collaborators.adjuster);
        if self.diagnostics.has_error() {
            return;
        }

        let t_adjust = Instant::now();
        self.bind_all_images(collaborators.binder, aliases);
        if self.diagnostics.has_error() {
            return;
        }

        self.fips_seal(collaborators.fips_sealer);

        let t_bind = Instant::now();
        if self.options.exclude_local_symbols {
            let offset = self.read_only_region.cache_file_offset + self.read_only_region.size_in_use;
            self.update_header(|header| header.local_symbols_offset = offset);
        }
        let max_slide = self.max_slide();
        self.update_header(|header| header.max_slide = max_slide);

        // Slide info last among the content phases: it mutates pointers in
        // the data region.
        if self.aslr_enabled() {
            self.write_slide_info();
            if self.diagnostics.has_error() {
                return;
            }
        }

        let t_slide = Instant::now();
        // last sanity check on size
        let overflow = self.cache_overflow_amount();
        if overflow != 0 {
            self.diagnostics
                .error(BuildError::CacheOverflow(overflow / 1024 / 1024));
            return;
        }

        // The code signature is part of the file but never mapped.
        self.code_sign();
        if self.diagnostics.has_error() {
            return;
        }

        let ms = |from: Instant, to: Instant| (to - from).as_millis();
        let t_sign = Instant::now();
        self.diagnostics
            .verbose(format!("time to layout cache: {}ms", ms(t_start, t_layout)));
        self.diagnostics
            .verbose(format!("time to copy cached dylibs into buffer: {}ms", ms(t_layout, t_copy)));
        self.diagnostics.verbose(format!(
            "time to adjust segments for new split locations: {}ms",
            ms(t_copy, t_adjust)
        ));
        self.diagnostics
            .verbose(format!("time to bind all images: {}ms", ms(t_adjust, t_bind)));
        self.diagnostics
            .verbose(format!("time to compute slide info: {}ms", ms(t_bind, t_slide)));
        self.diagnostics.verbose(format!(
            "time to compute UUID and codesign cache file: {}ms",
            ms(t_slide, t_sign)
        ));
    }

    /// Order dylibs by the caller's map, then lexicographically by runtime
    /// path so layout is deterministic.
    fn make_sorted_dylibs(&mut self, dylibs: Vec<LoadedImage>) {
        let ordering = &self.options.dylib_ordering;
        let mut dylibs: Vec<DylibInfo> = dylibs
            .into_iter()
            .map(|image| DylibInfo {
                image,
                cache_location: Vec::new(),
            })
            .collect();
        dylibs.sort_by(|a, b| {
            let order_a = ordering.get(&a.image.runtime_path);
            let order_b = ordering.get(&b.image.runtime_path);
            match (order_a, order_b) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.image.runtime_path.cmp(&b.image.runtime_path),
            }
        });
        self.sorted_dylibs = dylibs;
    }

    pub fn cache_overflow_amount(&self) -> u64 {
        let layout = self.layout();
        if layout.regions_are_discontiguous {
            // each region lives in its own fixed span
            if self.read_execute_region.size_in_use > DISCONTIGUOUS_TEXT_SPAN {
                return self.read_execute_region.size_in_use - DISCONTIGUOUS_TEXT_SPAN;
            }
            if self.read_write_region.size_in_use > DISCONTIGUOUS_DATA_SPAN {
                return self.read_write_region.size_in_use - DISCONTIGUOUS_DATA_SPAN;
            }
            if self.read_only_region.size_in_use > DISCONTIGUOUS_RO_SPAN {
                return self.read_only_region.size_in_use - DISCONTIGUOUS_RO_SPAN;
            }
            return 0;
        }

        let already_optimized =
            self.read_only_region.size_in_use != self.read_only_region.buffer_size;
        let mut vm_size =
            self.read_only_region.unslid_load_address - self.read_execute_region.unslid_load_address;
        if already_optimized {
            vm_size += self.read_only_region.size_in_use;
        } else if self.options.exclude_local_symbols {
            vm_size += self.read_only_region.size_in_use * LINKEDIT_SHARE_WITHOUT_LOCALS / 100;
        } else {
            vm_size += self.read_only_region.size_in_use * LINKEDIT_SHARE_WITH_LOCALS / 100;
        }
        vm_size.saturating_sub(layout.shared_memory_size)
    }

    /// Remove the largest unreferenced dylibs until the overflow target is
    /// met, recording them in `evictions`.
    fn evict_leaf_dylibs(&mut self, mut reduction_target: u64) -> usize {
        let mut reference_count: HashMap<String, u32> = HashMap::new();
        for dylib in &self.sorted_dylibs {
            for dep in dylib.image.image.dependents() {
                *reference_count.entry(dep.path).or_default() += 1;
            }
        }

        struct Candidate {
            install_name: String,
            size: u64,
        }
        let mut unreferenced: Vec<Candidate> = self
            .sorted_dylibs
            .iter()
            .filter(|d| !reference_count.contains_key(d.image.install_name()))
            .map(|d| Candidate {
                install_name: d.image.install_name().to_owned(),
                // conservative: count all segments except LINKEDIT
                size: d
                    .image
                    .image
                    .segments()
                    .iter()
                    .filter(|s| s.name != "__LINKEDIT")
                    .map(|s| s.vm_size)
                    .sum(),
            })
            .collect();
        unreferenced.sort_by(|a, b| b.size.cmp(&a.size));

        for candidate in unreferenced {
            if self.options.verbose {
                self.diagnostics.warning(format!(
                    "to prevent cache overflow, not caching {}",
                    candidate.install_name
                ));
            }
            self.evictions.insert(candidate.install_name);
            if candidate.size > reduction_target {
                break;
            }
            reduction_target -= candidate.size;
        }

        let evictions = &self.evictions;
        self.sorted_dylibs
            .retain(|d| !evictions.contains(d.image.install_name()));
        self.evictions.len()
    }

    /// Compute placements for every segment of every dylib, in a fixed,
    /// deterministic order.
    fn assign_segment_addresses(&mut self) {
        let layout = self.layout();
        let dylib_count = self.sorted_dylibs.len();

        // Header reservation: header, mappings, worst-case branch pool
        // table, both image tables, and the install-name string pool.
        let mut start_offset = (size_of::<CacheHeader>() + 3 * size_of::<CacheMappingInfo>()) as u64;
        let max_pool_count = if layout.branch_reach != 0 {
            layout.shared_memory_size / layout.branch_reach
        } else {
            0
        };
        start_offset += max_pool_count * 8;
        start_offset += (size_of::<CacheImageInfo>() * dylib_count) as u64;
        start_offset += (size_of::<CacheImageTextInfo>() * dylib_count) as u64;
        for dylib in &self.sorted_dylibs {
            start_offset += dylib.image.install_name().len() as u64 + 1;
        }
        start_offset = align(start_offset, 12);

        self.branch_pool_starts.clear();

        // read+execute region
        self.read_execute_region = Region {
            arena_offset: 0,
            buffer_size: 0,
            size_in_use: 0,
            unslid_load_address: layout.shared_memory_start,
            cache_file_offset: 0,
        };
        let region_base = layout.shared_memory_start;
        let mut addr = region_base + start_offset;
        let mut last_pool_addr = addr;
        let mut pool_starts = Vec::new();
        for dylib in &mut self.sorted_dylibs {
            let segments = dylib.image.image.segments();
            let text_vm_addr = text_segment_vm_addr(&segments);
            let image_len = dylib.image.image.bytes().len();
            for seg in &segments {
                if seg.protections != (VmProt::READ | VmProt::EXECUTE) {
                    continue;
                }
                // Branch-reach-limited archs get a veneer pool before any
                // placement that would move out of range.
                if layout.branch_pool_text_size != 0
                    && addr + seg.vm_size - last_pool_addr > layout.branch_reach
                {
                    pool_starts.push(addr);
                    last_pool_addr = addr;
                    addr += layout.branch_pool_text_size;
                }
                // Keep __TEXT segments 4K or more aligned.
                addr = align(addr, seg.p2align.max(12));
                let offset_in_region = addr - region_base;
                let size = align(seg.size_of_sections, 12);
                dylib.cache_location.push(placement(
                    seg,
                    text_vm_addr,
                    image_len,
                    offset_in_region,
                    addr,
                    offset_in_region,
                    size,
                    size,
                ));
                addr += size;
            }
        }
        self.branch_pool_starts = pool_starts;
        for pool in &self.branch_pool_starts {
            self.diagnostics
                .verbose(format!("adding branch pool at 0x{pool:X}"));
        }
        let end_text = align(addr, layout.shared_region_align_p2);
        self.read_execute_region.buffer_size = end_text - region_base;
        self.read_execute_region.size_in_use = self.read_execute_region.buffer_size;

        // read+write region
        let mut addr = if layout.regions_are_discontiguous {
            layout.shared_memory_start + DISCONTIGUOUS_TEXT_SPAN
        } else {
            align(addr + layout.shared_region_padding, layout.shared_region_align_p2)
        };
        self.read_write_region = Region {
            arena_offset: addr - layout.shared_memory_start,
            buffer_size: 0,
            size_in_use: 0,
            unslid_load_address: addr,
            cache_file_offset: self.read_execute_region.size_in_use,
        };
        let rw_base = addr;
        let rw_file_offset = self.read_write_region.cache_file_offset;
        let rw_arena_offset = self.read_write_region.arena_offset;

        // __DATA_CONST segments pack tightly.
        let mut data_const_count = 0u32;
        for dylib in &mut self.sorted_dylibs {
            let segments = dylib.image.image.segments();
            let text_vm_addr = text_segment_vm_addr(&segments);
            let image_len = dylib.image.image.bytes().len();
            for seg in &segments {
                if seg.protections != (VmProt::READ | VmProt::WRITE)
                    || seg.name != "__DATA_CONST"
                {
                    continue;
                }
                data_const_count += 1;
                addr = align(addr, seg.p2align);
                let offset_in_region = addr - rw_base;
                dylib.cache_location.push(placement(
                    seg,
                    text_vm_addr,
                    image_len,
                    rw_arena_offset + offset_in_region,
                    addr,
                    rw_file_offset + offset_in_region,
                    seg.size_of_sections,
                    seg.file_size.min(seg.size_of_sections),
                ));
                addr += seg.size_of_sections;
            }
        }

        // __DATA and other plain writable segments.
        for dylib in &mut self.sorted_dylibs {
            let segments = dylib.image.image.segments();
            let text_vm_addr = text_segment_vm_addr(&segments);
            let image_len = dylib.image.image.bytes().len();
            for seg in &segments {
                if seg.protections != (VmProt::READ | VmProt::WRITE)
                    || seg.name == "__DATA_CONST"
                    || seg.name == "__DATA_DIRTY"
                {
                    continue;
                }
                if data_const_count > 10 {
                    // Pack __DATA segments only if we also have plenty of
                    // __DATA_CONST segments.
                    addr = align(addr, seg.p2align);
                } else {
                    addr = align(addr, seg.p2align.max(12));
                }
                let offset_in_region = addr - rw_base;
                dylib.cache_location.push(placement(
                    seg,
                    text_vm_addr,
                    image_len,
                    rw_arena_offset + offset_in_region,
                    addr,
                    rw_file_offset + offset_in_region,
                    seg.size_of_sections,
                    seg.file_size.min(seg.size_of_sections),
                ));
                addr += seg.size_of_sections;
            }
        }

        // __DATA_DIRTY segments, packed consecutively in the caller's
        // dirty-data order (then lexicographic by runtime path).
        let dirty_ordering = &self.options.dirty_data_segment_ordering;
        let mut dirty_indexes: Vec<usize> = (0..dylib_count).collect();
        dirty_indexes.sort_by(|&a, &b| {
            let path_a = &self.sorted_dylibs[a].image.runtime_path;
            let path_b = &self.sorted_dylibs[b].image.runtime_path;
            match (dirty_ordering.get(path_a), dirty_ordering.get(path_b)) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => path_a.cmp(path_b),
            }
        });
        addr = align(addr, 12);
        for index in dirty_indexes {
            let dylib = &mut self.sorted_dylibs[index];
            let segments = dylib.image.image.segments();
            let text_vm_addr = text_segment_vm_addr(&segments);
            let image_len = dylib.image.image.bytes().len();
            for seg in &segments {
                if seg.protections != (VmProt::READ | VmProt::WRITE)
                    || seg.name != "__DATA_DIRTY"
                {
                    continue;
                }
                addr = align(addr, seg.p2align);
                let offset_in_region = addr - rw_base;
                dylib.cache_location.push(placement(
                    seg,
                    text_vm_addr,
                    image_len,
                    rw_arena_offset + offset_in_region,
                    addr,
                    rw_file_offset + offset_in_region,
                    seg.size_of_sections,
                    seg.file_size.min(seg.size_of_sections),
                ));
                addr += seg.size_of_sections;
            }
        }
        let end_data = align(addr, layout.shared_region_align_p2);
        self.read_write_region.buffer_size = end_data - rw_base;
        self.read_write_region.size_in_use = self.read_write_region.buffer_size;

        // read-only region
        let mut addr = if layout.regions_are_discontiguous {
            layout.shared_memory_start + DISCONTIGUOUS_TEXT_SPAN + DISCONTIGUOUS_DATA_SPAN
        } else {
            align(addr + layout.shared_region_padding, layout.shared_region_align_p2)
        };
        self.read_only_region = Region {
            arena_offset: addr - layout.shared_memory_start,
            buffer_size: 0,
            size_in_use: 0,
            unslid_load_address: addr,
            cache_file_offset: self.read_write_region.cache_file_offset
                + self.read_write_region.size_in_use,
        };
        let ro_base = addr;
        let ro_file_offset = self.read_only_region.cache_file_offset;
        let ro_arena_offset = self.read_only_region.arena_offset;

        // Reserve space for kernel slide info at the start of the region,
        // sized for the largest fixed header of any format version.
        self.slide_info_file_offset = 0;
        self.slide_info_size_allocated = 0;
        if self.aslr_enabled() {
            let header_size =
                size_of::<CacheSlideInfo2>().max(size_of::<CacheSlideInfo3>()) as u64;
            let pages = self.read_write_region.size_in_use / PAGE_SIZE;
            self.slide_info_size_allocated = align(
                header_size + pages * layout.slide_info_bytes_per_page as u64,
                layout.shared_region_align_p2,
            );
            self.slide_info_file_offset = ro_file_offset;
            addr += self.slide_info_size_allocated;
        }

        // Read-only (non-LINKEDIT) segments first.
        for dylib in &mut self.sorted_dylibs {
            let segments = dylib.image.image.segments();
            let text_vm_addr = text_segment_vm_addr(&segments);
            let image_len = dylib.image.image.bytes().len();
            for seg in &segments {
                if seg.protections != VmProt::READ || seg.name == "__LINKEDIT" {
                    continue;
                }
                addr = align(addr, seg.p2align.max(12));
                let offset_in_region = addr - ro_base;
                let size = align(seg.size_of_sections, 12);
                dylib.cache_location.push(placement(
                    seg,
                    text_vm_addr,
                    image_len,
                    ro_arena_offset + offset_in_region,
                    addr,
                    ro_file_offset + offset_in_region,
                    size,
                    seg.size_of_sections,
                ));
                addr += size;
            }
        }

        // LINKEDIT segments after, 16KB aligned as a block.
        addr = align(addr, 14);
        for dylib in &mut self.sorted_dylibs {
            let segments = dylib.image.image.segments();
            let text_vm_addr = text_segment_vm_addr(&segments);
            let image_len = dylib.image.image.bytes().len();
            for seg in &segments {
                if seg.protections != VmProt::READ || seg.name != "__LINKEDIT" {
                    continue;
                }
                addr = align(addr, seg.p2align.max(12));
                let offset_in_region = addr - ro_base;
                let size = align(seg.size_of_sections, 12);
                dylib.cache_location.push(placement(
                    seg,
                    text_vm_addr,
                    image_len,
                    ro_arena_offset + offset_in_region,
                    addr,
                    ro_file_offset + offset_in_region,
                    size,
                    seg.file_size.min(seg.size_of_sections),
                ));
                addr += size;
            }
        }

        // Room for the branch pools' private LINKEDIT.
        addr += self.branch_pool_starts.len() as u64 * layout.branch_pool_linkedit_size;

        let end_read_only = align(addr, layout.shared_region_align_p2);
        self.read_only_region.buffer_size = end_read_only - ro_base;
        self.read_only_region.size_in_use = self.read_only_region.buffer_size;

        // Callers address placements by original segment ordinal.
        for dylib in &mut self.sorted_dylibs {
            dylib
                .cache_location
                .sort_by_key(|loc| loc.src_segment_index);
        }
    }

    fn write_cache_header(&mut self) {
        let layout = self.layout();
        // "dyld_v1" + spaces + archName, padded so the name ends at byte 15
        let mut magic = [0u8; 16];
        let prefix = CACHE_MAGIC_PREFIX.as_bytes();
        magic[..prefix.len()].copy_from_slice(prefix);
        for byte in &mut magic[prefix.len()..15] {
            *byte = b' ';
        }
        let arch = self.options.arch_name.as_bytes();
        magic[15 - arch.len()..15].copy_from_slice(arch);

        let dylib_count = self.sorted_dylibs.len() as u32;
        let mapping_offset = size_of::<CacheHeader>() as u32;
        let branch_pools_offset = mapping_offset + 3 * size_of::<CacheMappingInfo>() as u32;
        let images_offset = branch_pools_offset + 8 * self.branch_pool_starts.len() as u32;
        let images_count = dylib_count + self.alias_count;
        let images_text_offset =
            images_offset as u64 + (size_of::<CacheImageInfo>() as u64) * images_count as u64;

        let header = CacheHeader {
            magic,
            mapping_offset,
            mapping_count: 3,
            images_offset,
            images_count,
            dyld_base_address: 0,
            code_signature_offset: 0,
            code_signature_size: 0,
            slide_info_offset: self.slide_info_file_offset,
            slide_info_size: self.slide_info_size_allocated,
            local_symbols_offset: 0,
            local_symbols_size: 0,
            uuid: [0; 16], // overwritten during signing
            cache_type: if self.options.optimize_stubs {
                CACHE_TYPE_PRODUCTION
            } else {
                CACHE_TYPE_DEVELOPMENT
            },
            branch_pools_offset,
            branch_pools_count: self.branch_pool_starts.len() as u32,
            accelerate_info_addr: 0,
            accelerate_info_size: 0,
            images_text_offset,
            images_text_count: dylib_count as u64,
            dylibs_image_group_addr: 0,
            dylibs_image_group_size: 0,
            other_image_group_addr: 0,
            other_image_group_size: 0,
            prog_closures_addr: 0,
            prog_closures_size: 0,
            prog_closures_trie_addr: 0,
            prog_closures_trie_size: 0,
            platform: self.options.platform as u8,
            dylibs_expected_on_disk: (!self.options.dylibs_removed_during_mastering) as u8,
            simulator: self.options.for_simulator as u8,
            locally_built_cache: self.options.is_locally_built_cache as u8,
            format_version: CACHE_FORMAT_VERSION,
            shared_region_start: layout.shared_memory_start,
            shared_region_size: layout.shared_memory_size,
            max_slide: 0, // recorded once the final size is established
        };
        self.arena[..size_of::<CacheHeader>()].copy_from_slice(struct_bytes(&header));

        // mappings
        let mappings = [
            CacheMappingInfo {
                address: self.read_execute_region.unslid_load_address,
                size: self.read_execute_region.size_in_use,
                file_offset: 0,
                max_prot: (VmProt::READ | VmProt::EXECUTE).bits(),
                init_prot: (VmProt::READ | VmProt::EXECUTE).bits(),
            },
            CacheMappingInfo {
                address: self.read_write_region.unslid_load_address,
                size: self.read_write_region.size_in_use,
                file_offset: self.read_execute_region.size_in_use,
                max_prot: (VmProt::READ | VmProt::WRITE).bits(),
                init_prot: (VmProt::READ | VmProt::WRITE).bits(),
            },
            CacheMappingInfo {
                address: self.read_only_region.unslid_load_address,
                size: self.read_only_region.size_in_use,
                file_offset: self.read_execute_region.size_in_use
                    + self.read_write_region.size_in_use,
                max_prot: VmProt::READ.bits(),
                init_prot: VmProt::READ.bits(),
            },
        ];
        let mut offset = mapping_offset as usize;
        for mapping in &mappings {
            self.arena[offset..offset + size_of::<CacheMappingInfo>()]
                .copy_from_slice(struct_bytes(mapping));
            offset += size_of::<CacheMappingInfo>();
        }

        // branch pool addresses
        let mut offset = branch_pools_offset as usize;
        for pool in &self.branch_pool_starts {
            self.arena[offset..offset + 8].copy_from_slice(&pool.to_le_bytes());
            offset += 8;
        }

        // image table, image-text table, and the shared install-name pool
        let mut image_offset = images_offset as usize;
        let mut text_offset = images_text_offset as usize;
        let mut string_offset =
            images_text_offset as usize + size_of::<CacheImageTextInfo>() * dylib_count as usize;
        for dylib in &self.sorted_dylibs {
            let install_name = dylib.image.install_name();
            let address = dylib.cache_location[0].dst_unslid_address;
            let (mod_time, inode) = if self.options.dylibs_removed_during_mastering {
                (0, path_hash(install_name))
            } else {
                (dylib.image.mtime, dylib.image.inode)
            };
            let info = CacheImageInfo {
                address,
                mod_time,
                inode,
                path_file_offset: string_offset as u32,
                pad: 0,
            };
            self.arena[image_offset..image_offset + size_of::<CacheImageInfo>()]
                .copy_from_slice(struct_bytes(&info));
            image_offset += size_of::<CacheImageInfo>();

            let text = CacheImageTextInfo {
                uuid: dylib.image.image.uuid(),
                load_address: address,
                text_segment_size: dylib.cache_location[0].dst_segment_size as u32,
                path_offset: string_offset as u32,
            };
            self.arena[text_offset..text_offset + size_of::<CacheImageTextInfo>()]
                .copy_from_slice(struct_bytes(&text));
            text_offset += size_of::<CacheImageTextInfo>();

            self.arena[string_offset..string_offset + install_name.len()]
                .copy_from_slice(install_name.as_bytes());
            string_offset += install_name.len() + 1;
        }

        // make sure the header did not overflow into the first mapped image
        let first_image = self.sorted_dylibs[0]
            .cache_location
            .iter()
            .map(|loc| loc.dst_unslid_address)
            .min()
            .unwrap_or(u64::MAX);
        debug_assert!(
            (string_offset as u64) <= first_image - self.read_execute_region.unslid_load_address
        );
    }

    /// Copy every placed segment into the arena. Each task writes a
    /// disjoint destination slice, so the copies fan out over the pool.
    fn copy_raw_segments(&mut self) {
        let arena = &mut self.arena;
        let dylibs = &self.sorted_dylibs;

        let mut jobs: Vec<(u64, u64, &[u8])> = Vec::new();
        for dylib in dylibs {
            let bytes = dylib.image.image.bytes();
            for loc in &dylib.cache_location {
                let end = (loc.src_offset + loc.copy_size as usize).min(bytes.len());
                jobs.push((
                    loc.dst_arena_offset,
                    loc.dst_segment_size,
                    &bytes[loc.src_offset..end.max(loc.src_offset)],
                ));
            }
        }
        jobs.sort_by_key(|&(dst, _, _)| dst);

        // Carve the arena into the disjoint destination slices.
        let mut copies: Vec<(&mut [u8], &[u8])> = Vec::with_capacity(jobs.len());
        let mut rest: &mut [u8] = arena;
        let mut consumed = 0u64;
        for (dst, len, src) in jobs {
            let remaining = rest;
            let (_, tail) = remaining.split_at_mut((dst - consumed) as usize);
            let (piece, tail) = tail.split_at_mut(len as usize);
            copies.push((piece, src));
            rest = tail;
            consumed = dst + len;
        }

        copies.par_iter_mut().for_each(|(dst, src)| {
            dst[..src.len()].copy_from_slice(src);
            // the tail beyond copy_size is zero-fill and already zero
        });
    }

    /// Let the external adjuster rewrite each image's intra-image
    /// references, in parallel where the platform allows it. Each task
    /// gets a private diagnostics sink; the first error is promoted.
    fn adjust_all_images_for_new_segment_locations(&mut self, adjuster: Option<&dyn ImageAdjuster>) {
        let Some(adjuster) = adjuster else { return };

        let arena = &mut self.arena;
        let dylibs = &self.sorted_dylibs;

        // Destination slices, carved in arena order, then regrouped per
        // image in original segment order.
        let mut order: Vec<(usize, usize)> = Vec::new(); // (dylib, placement)
        for (dylib_index, dylib) in dylibs.iter().enumerate() {
            for placement_index in 0..dylib.cache_location.len() {
                order.push((dylib_index, placement_index));
            }
        }
        order.sort_by_key(|&(d, p)| dylibs[d].cache_location[p].dst_arena_offset);

        let mut segment_slices: Vec<Vec<Option<&mut [u8]>>> = dylibs
            .iter()
            .map(|d| d.cache_location.iter().map(|_| None).collect())
            .collect();
        let mut rest: &mut [u8] = arena;
        let mut consumed = 0u64;
        for (dylib_index, placement_index) in order {
            let loc = &dylibs[dylib_index].cache_location[placement_index];
            let remaining = rest;
            let (_, tail) = remaining.split_at_mut((loc.dst_arena_offset - consumed) as usize);
            let (piece, tail) = tail.split_at_mut(loc.dst_segment_size as usize);
            segment_slices[dylib_index][placement_index] = Some(piece);
            rest = tail;
            consumed = loc.dst_arena_offset + loc.dst_segment_size;
        }

        let mut views: Vec<ImageToAdjust<'_>> = Vec::with_capacity(dylibs.len());
        for (dylib, slices) in dylibs.iter().zip(segment_slices) {
            let segments = dylib
                .cache_location
                .iter()
                .zip(slices)
                .map(|(loc, slice)| PlacedSegment {
                    name: &loc.seg_name,
                    source_index: loc.src_segment_index,
                    unslid_address: loc.dst_unslid_address,
                    cache_file_offset: loc.dst_file_offset,
                    bytes: slice.expect("every placement carved"),
                })
                .collect();
            views.push(ImageToAdjust {
                runtime_path: &dylib.image.runtime_path,
                source: dylib.image.image.bytes(),
                segments,
            });
        }

        let mut diags: Vec<Diagnostics> = views
            .iter()
            .map(|_| Diagnostics::new(self.options.logging_prefix.clone(), self.options.verbose))
            .collect();

        if self.options.platform == Platform::MacOs {
            views
                .par_iter_mut()
                .zip(diags.par_iter_mut())
                .for_each(|(view, diag)| adjuster.adjust_image(view, diag));
        } else {
            // the adjuster is not thread-safe off macOS
            for (view, diag) in views.iter_mut().zip(diags.iter_mut()) {
                adjuster.adjust_image(view, diag);
            }
        }

        for diag in diags {
            if diag.has_error() {
                self.diagnostics
                    .error(BuildError::Collaborator(diag.error_message()));
                break;
            }
            self.diagnostics.merge(diag);
        }
    }

    /// Drive the external binder; all of its effects funnel through the
    /// orchestrator.
    fn bind_all_images(&mut self, binder: Option<&dyn CacheBinder>, aliases: &[FileAlias]) {
        let Some(binder) = binder else { return };
        // Aliases only affect closure emission, which the binder owns.
        let _ = aliases;

        let layout = self.layout();
        let image_bases: Vec<u64> = self
            .sorted_dylibs
            .iter()
            .map(|d| d.cache_location[0].dst_unslid_address)
            .collect();
        let image_deps: Vec<Vec<String>> = self
            .sorted_dylibs
            .iter()
            .map(|d| d.image.image.dependents().into_iter().map(|dep| dep.path).collect())
            .collect();

        let mastered = self.options.dylibs_removed_during_mastering;
        let dylib_infos: Vec<CachedDylibInfo<'_>> = self
            .sorted_dylibs
            .iter()
            .enumerate()
            .map(|(index, d)| {
                let (mtime, inode) = if mastered {
                    (0, path_hash(d.image.install_name()))
                } else {
                    (d.image.mtime, d.image.inode)
                };
                CachedDylibInfo {
                    image_index: index,
                    install_name: d.image.install_name(),
                    load_address: image_bases[index],
                    mtime,
                    inode,
                }
            })
            .collect();

        let mut orchestrator = FixupOrchestrator::new(
            &mut self.arena,
            layout.shared_memory_start,
            layout.is_64,
            self.read_write_region.arena_offset,
            self.read_write_region.size_in_use,
            image_bases,
            image_deps,
            &mut self.aslr_tracker,
            &mut self.patch_table,
            &mut self.missing_weak_imports,
        );
        let mut diag = Diagnostics::new(self.options.logging_prefix.clone(), self.options.verbose);
        binder.bind_images(&dylib_infos, &mut orchestrator, &mut diag);
        self.diagnostics.merge(diag);
    }

    /// FIPS-seal corecrypto: locate the hash-store and text sections and
    /// hand them to the external sealer. Every miss is only a warning.
    fn fips_seal(&mut self, sealer: Option<&dyn TextSealer>) {
        let Some(sealer) = sealer else { return };

        let corecrypto = self
            .sorted_dylibs
            .iter()
            .find(|d| d.image.install_name() == "/usr/lib/system/libcorecrypto.dylib");
        let Some(dylib) = corecrypto else {
            self.diagnostics
                .warning("Could not find libcorecrypto.dylib, skipping FIPS sealing");
            return;
        };

        let locate = |section: &str| -> Option<(u64, usize)> {
            let image_bytes = dylib.image.image.bytes();
            let bytes = dylib.image.image.section_bytes("__TEXT", section)?;
            let source_offset = bytes.as_ptr() as usize - image_bytes.as_ptr() as usize;
            let loc = dylib.cache_location.iter().find(|loc| {
                source_offset >= loc.src_offset
                    && source_offset < loc.src_offset + loc.copy_size as usize
            })?;
            Some((
                loc.dst_arena_offset + (source_offset - loc.src_offset) as u64,
                bytes.len(),
            ))
        };

        let Some((store_offset, store_size)) = locate("__fips_hmacs") else {
            self.diagnostics.warning(
                "Could not find __TEXT/__fips_hmacs section in libcorecrypto.dylib, skipping FIPS sealing",
            );
            return;
        };
        if store_size != 32 {
            self.diagnostics.warning(
                "__TEXT/__fips_hmacs section in libcorecrypto.dylib is not 32 bytes in size, skipping FIPS sealing",
            );
            return;
        }
        let Some((text_offset, text_size)) = locate("__text") else {
            self.diagnostics.warning(
                "Could not find __TEXT/__text section in libcorecrypto.dylib, skipping FIPS sealing",
            );
            return;
        };

        let text = self.arena[text_offset as usize..text_offset as usize + text_size].to_vec();
        let store = &mut self.arena[store_offset as usize..store_offset as usize + store_size];
        sealer.seal(&text, store);
    }

    fn max_slide(&self) -> u64 {
        let layout = self.layout();
        if layout.regions_are_discontiguous {
            // three non-contiguous chunks, each in its own fixed span
            let slide_text = DISCONTIGUOUS_TEXT_SPAN - self.read_execute_region.size_in_use;
            let slide_data = DISCONTIGUOUS_DATA_SPAN - self.read_write_region.size_in_use;
            let slide_ro = DISCONTIGUOUS_RO_SPAN - self.read_only_region.size_in_use;
            slide_text.min(slide_data).min(slide_ro)
        } else {
            (layout.shared_memory_start + layout.shared_memory_size)
                - (self.read_only_region.unslid_load_address + self.read_only_region.size_in_use)
        }
    }

    pub(crate) fn update_header<F: FnOnce(&mut CacheHeader)>(&mut self, update: F) {
        let mut header: CacheHeader =
            read_struct(&self.arena, 0).expect("header written before updates");
        update(&mut header);
        self.arena[..size_of::<CacheHeader>()].copy_from_slice(struct_bytes(&header));
    }

    /// Fill in the slide-info reservation at the start of the read-only
    /// region. Mutates data-region pointers, so it runs after binding.
    fn write_slide_info(&mut self) {
        let layout = self.layout();

        // Owned lookup table so the error path can name the dylib and
        // segment while the arena is mutably borrowed.
        let spans: Vec<(u64, u64, String, String)> = self
            .sorted_dylibs
            .iter()
            .flat_map(|dylib| {
                dylib.cache_location.iter().map(|loc| {
                    (
                        loc.dst_unslid_address,
                        loc.dst_unslid_address + loc.dst_segment_size,
                        dylib.image.runtime_path.clone(),
                        loc.seg_name.clone(),
                    )
                })
            })
            .collect();
        let rw_base = self.read_write_region.unslid_load_address;
        let locate = move |rw_offset: u64| -> (String, String) {
            let addr = rw_base + rw_offset;
            for (start, end, dylib, segment) in &spans {
                if addr >= *start && addr < *end {
                    return (dylib.clone(), segment.clone());
                }
            }
            ("???".to_owned(), "???".to_owned())
        };

        let rw_range = self.read_write_region.arena_offset as usize
            ..(self.read_write_region.arena_offset + self.read_write_region.size_in_use) as usize;
        let ro_start = self.read_only_region.arena_offset as usize;
        let (head, tail) = self.arena.split_at_mut(ro_start);
        let rw = &mut head[rw_range];
        let slide_buf = &mut tail[..self.slide_info_size_allocated as usize];

        let final_size = if layout.arch_name == "arm64e" {
            slide_info::write_slide_info_v3(
                layout,
                rw,
                slide_buf,
                &self.aslr_tracker,
                &mut self.diagnostics,
            )
        } else if layout.is_64 {
            slide_info::write_slide_info_paged::<Pointer64>(
                2,
                layout,
                rw,
                slide_buf,
                &self.aslr_tracker,
                &locate,
                &mut self.diagnostics,
            )
        } else if layout.arch_name == "arm64_32" {
            slide_info::write_slide_info_paged::<Pointer32>(
                4,
                layout,
                rw,
                slide_buf,
                &self.aslr_tracker,
                &locate,
                &mut self.diagnostics,
            )
        } else {
            slide_info::write_slide_info_paged::<Pointer32>(
                2,
                layout,
                rw,
                slide_buf,
                &self.aslr_tracker,
                &locate,
                &mut self.diagnostics,
            )
        };

        if let Some(size) = final_size {
            self.update_header(|header| header.slide_info_size = size);
        }
    }

    fn code_sign(&mut self) {
        let layout = self.layout();
        let signed_size = self.read_execute_region.size_in_use
            + self.read_write_region.size_in_use
            + self.read_only_region.size_in_use
            + self.local_symbols_region.size_in_use;

        let signature_layout = SignatureLayout::compute(
            self.options.code_signing_digest_mode,
            layout.arch_name,
            self.options.dylibs_removed_during_mastering,
            self.options.optimize_stubs,
            signed_size,
        );

        // Record size and location of the signature in the header before
        // hashing any page.
        let sig_size = signature_layout.sig_size;
        self.update_header(|header| {
            header.code_signature_offset = signed_size;
            header.code_signature_size = sig_size;
        });

        let rx_size = self.read_execute_region.size_in_use as usize;
        let (rx, rest) = self.arena.split_at_mut(rx_size);
        let rw_start = self.read_write_region.arena_offset as usize - rx_size;
        let rw = &rest[rw_start..rw_start + self.read_write_region.size_in_use as usize];
        let ro_start = self.read_only_region.arena_offset as usize - rx_size;
        let ro = &rest[ro_start..ro_start + self.read_only_region.size_in_use as usize];

        let regions = RegionsToSign {
            rx,
            rw,
            ro,
            local_symbols: &[],
            uuid_offset: offset_of!(CacheHeader, uuid),
        };
        self.code_signature = signature_layout.sign(
            regions,
            self.read_execute_region.cache_file_offset,
            self.read_execute_region.size_in_use,
            &mut self.diagnostics,
        );
    }
}

/// First `__TEXT` vm address of an image; source bytes are addressed
/// relative to it.
fn text_segment_vm_addr(segments: &[crate::images::SegmentInfo]) -> u64 {
    segments
        .iter()
        .find(|s| s.name == "__TEXT")
        .map(|s| s.vm_addr)
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn placement(
    seg: &crate::images::SegmentInfo,
    text_vm_addr: u64,
    image_len: usize,
    dst_arena_offset: u64,
    dst_unslid_address: u64,
    dst_file_offset: u64,
    dst_segment_size: u64,
    copy_size: u64,
) -> SegmentMappingInfo {
    debug_assert!(dst_segment_size >= copy_size);
    SegmentMappingInfo {
        src_segment_index: seg.index,
        seg_name: seg.name.clone(),
        src_offset: ((seg.vm_addr - text_vm_addr) as usize).min(image_len),
        dst_arena_offset,
        dst_unslid_address,
        dst_file_offset,
        dst_segment_size,
        copy_size,
    }
}

/// Fallible, lazily-backed zeroed allocation: the arena spans the whole
/// worst-case cache but most of it is never touched.
fn allocate_zeroed(size: usize) -> Option<Vec<u8>> {
    if size == 0 {
        return Some(Vec::new());
    }
    let layout = std::alloc::Layout::array::<u8>(size).ok()?;
    // SAFETY: non-zero size; the pointer, length, and capacity all come
    // from this one allocation.
    unsafe {
        let ptr = std::alloc::alloc_zeroed(layout);
        if ptr.is_null() {
            return None;
        }
        Some(Vec::from_raw_parts(ptr, size, size))
    }
}

/// Stable hash of an install name, used as a synthetic inode for mastered
/// caches.
fn path_hash(path: &str) -> u64 {
    let mut sum = 0u64;
    for byte in path.bytes() {
        sum = sum.wrapping_add(sum.wrapping_mul(4)).wrapping_add(byte as u64);
    }
    sum
}

fn hex20(hash: &[u8; 20]) -> String {
    let mut out = String::with_capacity(40);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_hash_matches_accumulator() {
        // sum = sum*5 + byte
        let mut expected = 0u64;
        for byte in b"/usr/lib/libSystem.B.dylib" {
            expected = expected.wrapping_mul(5).wrapping_add(*byte as u64);
        }
        assert_eq!(path_hash("/usr/lib/libSystem.B.dylib"), expected);
    }

    #[test]
    fn unknown_arch_is_fatal_at_construction() {
        let options = CreateOptions {
            arch_name: "riscv64".into(),
            ..CreateOptions::default()
        };
        let builder = CacheBuilder::new(options);
        assert!(
            builder
                .error_message()
                .contains("without support for: 'riscv64'")
        );
    }
}
