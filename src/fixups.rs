//! Fixup orchestration: turning binder events into cache-relative pointers.
//!
//! The external closure builder walks each dylib's fixup metadata and
//! reports rebases and binds back through [`FixupOrchestrator`]; only the
//! orchestrator writes to the cache buffer, records ASLR locations, and
//! grows the per-exported-symbol patch table.

use std::collections::{BTreeMap, BTreeSet};

use crate::aslr_tracker::AslrTracker;
use crate::diagnostics::Diagnostics;

/// Where a bound slot points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget {
    /// Offset from the cache base address.
    SharedCache { offset: u64 },
    /// A literal value, e.g. zero for a missing weak import. Never
    /// slide-sensitive.
    Absolute { value: u64 },
}

/// Symbol-resolution details accompanying a bind event.
#[derive(Debug, Clone)]
pub struct ResolvedTargetInfo {
    pub addend: u64,
    pub symbol_name: String,
    /// Index of the admitted dylib exporting the symbol.
    pub found_in_dylib: usize,
    /// Set on the second, weak-coalescing pass; an already slide-marked
    /// slot is left alone then.
    pub weak_coalesce: bool,
    /// Ordinal of the dependent library the symbol was looked up in
    /// (1-based; 0 and negatives are special bind ordinals).
    pub lib_ordinal: i64,
}

/// One use of an exported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLocation {
    /// Offset of the slot from the cache base.
    pub cache_offset: u64,
    pub addend: u64,
    /// Raw rewritten pointer for authenticated slots, carrying the
    /// diversity/key bits.
    pub auth: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PatchEntry {
    pub symbol_name: String,
    uses: Vec<PatchLocation>,
}

/// Exported-symbol patch table, keyed by the export's cache offset. Built
/// while binding, consumed by the external image-array emitter.
#[derive(Debug, Default)]
pub struct PatchTable {
    exports: BTreeMap<u64, PatchEntry>,
    exports_of_image: BTreeMap<usize, BTreeSet<u64>>,
}

/// One export plus its de-duplicated uses, as handed to the consumer.
#[derive(Debug)]
pub struct PatchInfo<'a> {
    pub export_cache_offset: u64,
    pub export_symbol_name: &'a str,
    pub uses: Vec<PatchLocation>,
}

impl PatchTable {
    fn add_use(&mut self, image: usize, export_offset: u64, symbol_name: &str, loc: PatchLocation) {
        let entry = self.exports.entry(export_offset).or_default();
        if entry.symbol_name.is_empty() {
            entry.symbol_name = symbol_name.to_owned();
        }
        entry.uses.push(loc);
        self.exports_of_image
            .entry(image)
            .or_default()
            .insert(export_offset);
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// All exports of one admitted dylib that anything in the cache binds
    /// to, each with its unique use sites.
    pub fn patches_for_image(&self, image: usize) -> Vec<PatchInfo<'_>> {
        let Some(offsets) = self.exports_of_image.get(&image) else {
            return Vec::new();
        };
        offsets
            .iter()
            .map(|offset| {
                let entry = &self.exports[offset];
                let mut uses = Vec::with_capacity(entry.uses.len());
                for u in &entry.uses {
                    if !uses.contains(u) {
                        uses.push(*u);
                    }
                }
                PatchInfo {
                    export_cache_offset: *offset,
                    export_symbol_name: &entry.symbol_name,
                    uses,
                }
            })
            .collect()
    }
}

/// Identity of one admitted dylib as presented to the binder.
#[derive(Debug, Clone, Copy)]
pub struct CachedDylibInfo<'a> {
    pub image_index: usize,
    pub install_name: &'a str,
    pub load_address: u64,
    pub mtime: u64,
    pub inode: u64,
}

/// External closure builder. Its only side channel back into the cache is
/// the orchestrator it is handed.
pub trait CacheBinder {
    fn bind_images(
        &self,
        dylibs: &[CachedDylibInfo<'_>],
        sink: &mut FixupOrchestrator<'_>,
        diag: &mut Diagnostics,
    );
}

// 64-bit chained fixup slot: bit 63 = authenticated, bit 62 = bind,
// bits 51..62 = offset to next slot in 8-byte strides.
const CHAIN_AUTH: u64 = 1 << 63;
const CHAIN_BIND: u64 = 1 << 62;
const CHAIN_NEXT_SHIFT: u32 = 51;
const CHAIN_NEXT_MASK: u64 = 0x7FF;
const CHAIN_ORDINAL_MASK: u64 = 0xFFFF;
const CHAIN_PLAIN_TARGET_MASK: u64 = (1 << 51) - 1;
/// authRebase keeps diversity, address-diversity, key, next and auth bits.
const CHAIN_AUTH_KEEP_MASK: u64 = 0xBFFF_FFFF_0000_0000;

pub struct FixupOrchestrator<'a> {
    arena: &'a mut [u8],
    shared_memory_start: u64,
    is_64: bool,
    rw_arena_offset: u64,
    rw_size: u64,
    /// Unslid load address of each admitted dylib.
    image_bases: Vec<u64>,
    /// Dependent load paths of each admitted dylib, by ordinal.
    image_deps: Vec<Vec<String>>,
    aslr: &'a mut AslrTracker,
    patches: &'a mut PatchTable,
    missing_weak_imports: &'a mut BTreeMap<u64, String>,
}

impl<'a> FixupOrchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        arena: &'a mut [u8],
        shared_memory_start: u64,
        is_64: bool,
        rw_arena_offset: u64,
        rw_size: u64,
        image_bases: Vec<u64>,
        image_deps: Vec<Vec<String>>,
        aslr: &'a mut AslrTracker,
        patches: &'a mut PatchTable,
        missing_weak_imports: &'a mut BTreeMap<u64, String>,
    ) -> Self {
        FixupOrchestrator {
            arena,
            shared_memory_start,
            is_64,
            rw_arena_offset,
            rw_size,
            image_bases,
            image_deps,
            aslr,
            patches,
            missing_weak_imports,
        }
    }

    /// Cache (and arena) offset of a slot, from an image-relative offset.
    fn slot_offset(&self, image: usize, runtime_offset: u64) -> u64 {
        self.image_bases[image] + runtime_offset - self.shared_memory_start
    }

    fn rw_offset(&self, slot: u64) -> u64 {
        assert!(
            slot >= self.rw_arena_offset && slot < self.rw_arena_offset + self.rw_size,
            "fixup slot 0x{slot:X} outside writable region"
        );
        slot - self.rw_arena_offset
    }

    fn read_u64(&self, slot: u64) -> u64 {
        let slot = slot as usize;
        u64::from_le_bytes(self.arena[slot..slot + 8].try_into().unwrap())
    }

    fn write_pointer(&mut self, slot: u64, value: u64) {
        let slot = slot as usize;
        if self.is_64 {
            self.arena[slot..slot + 8].copy_from_slice(&value.to_le_bytes());
        } else {
            self.arena[slot..slot + 4].copy_from_slice(&(value as u32).to_le_bytes());
        }
    }

    /// Mark an image-relative slot as slide-sensitive.
    pub fn rebase(&mut self, image: usize, runtime_offset: u64) {
        let slot = self.slot_offset(image, runtime_offset);
        let rw = self.rw_offset(slot);
        self.aslr.add(rw);
    }

    /// Resolve a bind: write the target's absolute cache address and record
    /// the use in the patch table. Absolute targets write the literal value
    /// and are never slide-sensitive.
    pub fn bind(
        &mut self,
        image: usize,
        runtime_offset: u64,
        target: BindTarget,
        info: &ResolvedTargetInfo,
    ) {
        let slot = self.slot_offset(image, runtime_offset);
        match target {
            BindTarget::SharedCache { offset } => {
                let export_offset = offset.wrapping_sub(info.addend);
                self.patches.add_use(
                    info.found_in_dylib,
                    export_offset,
                    &info.symbol_name,
                    PatchLocation {
                        cache_offset: slot,
                        addend: info.addend,
                        auth: None,
                    },
                );
                let rw = self.rw_offset(slot);
                // The binder runs a second pass for weak-coalescing info;
                // a slot it already resolved stays as-is.
                if info.weak_coalesce && self.aslr.has(rw) {
                    return;
                }
                self.write_pointer(slot, self.shared_memory_start + offset);
                self.aslr.add(rw);
            }
            BindTarget::Absolute { value } => {
                self.write_pointer(slot, value);
                // Split-seg processing may already have marked the slot.
                let rw = self.rw_offset(slot);
                self.aslr.remove(rw);
                if info.lib_ordinal > 0
                    && (info.lib_ordinal as usize) <= self.image_deps[image].len()
                {
                    let dep = self.image_deps[image][info.lib_ordinal as usize - 1].clone();
                    self.missing_weak_imports.insert(slot, dep);
                }
            }
        }
    }

    /// Walk chained-fixup starts, converting each bind entry into a
    /// rebase-shaped chain entry (plain or authenticated per the slot's
    /// auth flag) and marking every entry slide-sensitive.
    pub fn chained_bind(
        &mut self,
        image: usize,
        starts: &[u64],
        targets: &[BindTarget],
        infos: &[ResolvedTargetInfo],
    ) {
        for &start in starts {
            let mut runtime_offset = start;
            loop {
                let slot = self.slot_offset(image, runtime_offset);
                let raw = self.read_u64(slot);
                let next = (raw >> CHAIN_NEXT_SHIFT) & CHAIN_NEXT_MASK;
                let rw = self.rw_offset(slot);
                self.aslr.add(rw);

                if raw & CHAIN_BIND != 0 {
                    let ordinal = (raw & CHAIN_ORDINAL_MASK) as usize;
                    let info = &infos[ordinal];
                    match targets[ordinal] {
                        BindTarget::SharedCache { offset } => {
                            let rewritten = if raw & CHAIN_AUTH != 0 {
                                // auth bind -> auth rebase into the cache
                                (raw & CHAIN_AUTH_KEEP_MASK) | (offset & 0xFFFF_FFFF)
                            } else {
                                // plain bind -> plain rebase into the cache
                                (raw & (CHAIN_NEXT_MASK << CHAIN_NEXT_SHIFT))
                                    | ((self.shared_memory_start + offset)
                                        & CHAIN_PLAIN_TARGET_MASK)
                            };
                            self.arena[slot as usize..slot as usize + 8]
                                .copy_from_slice(&rewritten.to_le_bytes());
                            self.patches.add_use(
                                info.found_in_dylib,
                                offset.wrapping_sub(info.addend),
                                &info.symbol_name,
                                PatchLocation {
                                    cache_offset: slot,
                                    addend: info.addend,
                                    auth: (raw & CHAIN_AUTH != 0).then_some(rewritten),
                                },
                            );
                        }
                        BindTarget::Absolute { value } => {
                            self.arena[slot as usize..slot as usize + 8]
                                .copy_from_slice(&value.to_le_bytes());
                            self.aslr.remove(rw);
                        }
                    }
                }

                if next == 0 {
                    break;
                }
                runtime_offset += next * 8;
            }
        }
    }
}
