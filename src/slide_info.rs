//! Slide-info encoding: summarizing the ASLR bitmap as per-page chains.
//!
//! Three wire formats share the page walk. Versions 2 and 4 weave a delta
//! chain through the writable region in place: each rebase slot's unused
//! high bits record the distance to the next slot, and pages whose sites
//! are too far apart either hijack intervening "small" slots or fall back
//! to the shared extras pool. Version 3 assumes chained-fixup pointers are
//! already present and only rewrites each entry's next field.

use scroll::{Pread, Pwrite, LE};

use crate::arch::{ArchLayout, align};
use crate::aslr_tracker::AslrTracker;
use crate::cache_format::{
    CacheSlideInfo2, CacheSlideInfo3, PAGE_SIZE, SLIDE_PAGE_ATTR_END, SLIDE_PAGE_ATTR_EXTRA,
    SLIDE_PAGE_ATTR_NO_REBASE, SLIDE_PAGE_EXTRAS_MAX, SLIDE_V3_PAGE_ATTR_NO_REBASE,
    SLIDE4_PAGE_EXTRA_END, SLIDE4_PAGE_INDEX, SLIDE4_PAGE_NO_REBASE, SLIDE4_PAGE_USE_EXTRA,
    struct_bytes,
};
use crate::diagnostics::Diagnostics;
use crate::errors::BuildError;

/// Pointer width is the only thing that differs between the 32- and 64-bit
/// page walks.
pub(crate) trait SlidePointer {
    const BYTES: usize;
    fn get(buf: &[u8], offset: usize) -> u64;
    fn set(buf: &mut [u8], offset: usize, value: u64);
}

pub(crate) enum Pointer32 {}
pub(crate) enum Pointer64 {}

impl SlidePointer for Pointer32 {
    const BYTES: usize = 4;
    fn get(buf: &[u8], offset: usize) -> u64 {
        buf.pread_with::<u32>(offset, LE).expect("slot within page") as u64
    }
    fn set(buf: &mut [u8], offset: usize, value: u64) {
        buf.pwrite_with::<u32>(value as u32, offset, LE)
            .expect("slot within page");
    }
}

impl SlidePointer for Pointer64 {
    const BYTES: usize = 8;
    fn get(buf: &[u8], offset: usize) -> u64 {
        buf.pread_with::<u64>(offset, LE).expect("slot within page")
    }
    fn set(buf: &mut [u8], offset: usize, value: u64) {
        buf.pwrite_with::<u64>(value, offset, LE)
            .expect("slot within page");
    }
}

/// Resolves a writable-region offset to `(dylib, segment)` for error
/// reporting.
pub(crate) type LocateFn<'a> = dyn Fn(u64) -> (String, String) + 'a;

/// Format-specific knobs of the v2/v4 page walk.
struct PageWalk {
    delta_mask: u64,
    value_add: u64,
    no_rebase: u16,
    use_extra: u16,
    extra_end: u16,
    /// Largest representable extras index.
    extras_limit: usize,
    extras_overflow_msg: &'static str,
    /// Whether a slot's current value may be hijacked to thread the chain.
    small: fn(u64) -> bool,
}

/// v4 can thread chains through any value that fits in a signed 16-bit
/// range: the loader leaves such values unslid.
fn small_value(value: u64) -> bool {
    let high = value & 0xFFFF_8000;
    high == 0 || high == 0xFFFF_8000
}

enum ChainResult {
    Chained,
    /// No way to reach the next site; the chain was terminated at the last
    /// one.
    Broken,
    /// The last site does not hold a cache pointer.
    Invalid,
}

/// Try to extend the chain from `last_offset` to `offset` within one page,
/// hijacking small-valued slots if the direct delta does not reach.
fn make_rebase_chain<P: SlidePointer>(
    page: &mut [u8],
    last_offset: u16,
    offset: u16,
    walk: &PageWalk,
) -> ChainResult {
    let delta_mask = walk.delta_mask;
    let value_mask = !delta_mask;
    let value_add = walk.value_add;
    let delta_shift = delta_mask.trailing_zeros() - 2;
    let max_delta = (delta_mask >> delta_shift) as u32;

    let last_value = P::get(page, last_offset as usize);
    if last_value.wrapping_sub(value_add) & delta_mask != 0 {
        return ChainResult::Invalid;
    }
    if (offset as u32) <= last_offset as u32 + max_delta {
        // previous location in range, encode this location into its value
        let delta = (offset - last_offset) as u64;
        let new_last = (last_value.wrapping_sub(value_add) & value_mask) | (delta << delta_shift);
        P::set(page, last_offset as usize, new_last);
        return ChainResult::Chained;
    }

    // Distance between rebase locations is too far; look for small-valued
    // slots in between to thread the chain through.
    let mut hijacked: Vec<u16> = Vec::new();
    let mut i = last_offset as u32;
    while i < offset as u32 - max_delta {
        let mut found = 0u32;
        let mut j = max_delta;
        while j > 0 {
            let probe = (i + j) as usize;
            if probe + P::BYTES <= page.len() && (walk.small)(P::get(page, probe)) {
                found = i + j;
                break;
            }
            j -= 4;
        }
        if found == 0 {
            // No way to thread the chain; terminate it at the last site.
            let last_value = P::get(page, last_offset as usize);
            P::set(
                page,
                last_offset as usize,
                last_value.wrapping_sub(value_add) & value_mask,
            );
            return ChainResult::Broken;
        }
        hijacked.push(found as u16);
        i = found;
    }

    // A chain is possible: go back and link every hijacked slot.
    let mut prev = last_offset;
    for &next in hijacked.iter().chain(std::iter::once(&offset)) {
        let delta = ((next - prev) as u64) << delta_shift;
        let value = P::get(page, prev as usize);
        let new_value = if (walk.small)(value) {
            (value & value_mask) | delta
        } else {
            (value.wrapping_sub(value_add) & value_mask) | delta
        };
        P::set(page, prev as usize, new_value);
        prev = next;
    }
    ChainResult::Chained
}

/// Walk one page's bitmap, producing its page-start entry and any extras.
#[allow(clippy::too_many_arguments)]
fn add_page_starts<P: SlidePointer>(
    page: &mut [u8],
    page_rw_offset: u64,
    bitmap: &[bool],
    walk: &PageWalk,
    page_starts: &mut Vec<u16>,
    page_extras: &mut Vec<u16>,
    locate: &LocateFn<'_>,
    diag: &mut Diagnostics,
) {
    let value_mask = !walk.delta_mask;
    let mut start_value = walk.no_rebase;
    let mut last_offset: u16 = 0xFFFF;

    for (i, &set) in bitmap.iter().enumerate() {
        if !set {
            continue;
        }
        let offset = (i * 4) as u16;
        if start_value == walk.no_rebase {
            // first rebase location in page
            start_value = i as u16;
        } else {
            match make_rebase_chain::<P>(page, last_offset, offset, walk) {
                ChainResult::Chained => {}
                ChainResult::Broken => {
                    // Can't record all rebases in one chain; switch the
                    // page start to an index into the extras pool.
                    if start_value & walk.use_extra == 0 {
                        let index = page_extras.len();
                        if index > walk.extras_limit {
                            diag.error(BuildError::SlideInfoOverflow(walk.extras_overflow_msg));
                            return;
                        }
                        page_extras.push(start_value);
                        start_value = index as u16 | walk.use_extra;
                    }
                    page_extras.push(i as u16);
                }
                ChainResult::Invalid => {
                    let (dylib, segment) = locate(page_rw_offset);
                    diag.error(BuildError::RebaseOutOfRange {
                        last_offset,
                        segment,
                        dylib,
                    });
                    return;
                }
            }
        }
        last_offset = offset;
    }

    if last_offset != 0xFFFF {
        // mark end of chain: clear the delta, leaving value - value_add
        let value = P::get(page, last_offset as usize);
        P::set(
            page,
            last_offset as usize,
            value.wrapping_sub(walk.value_add) & value_mask,
        );
    }
    if start_value & walk.use_extra != 0 {
        *page_extras.last_mut().expect("extras non-empty") |= walk.extra_end;
    }
    page_starts.push(start_value);
}

fn paged_walk_for(version: u32, layout: &ArchLayout, pointer_bytes: usize) -> PageWalk {
    let value_add = if pointer_bytes == 8 {
        0
    } else {
        layout.shared_memory_start
    };
    if version == 2 {
        PageWalk {
            delta_mask: layout.pointer_delta_mask,
            value_add,
            no_rebase: SLIDE_PAGE_ATTR_NO_REBASE,
            use_extra: SLIDE_PAGE_ATTR_EXTRA,
            extra_end: SLIDE_PAGE_ATTR_END,
            extras_limit: SLIDE_PAGE_EXTRAS_MAX,
            extras_overflow_msg: "rebase overflow in v2 page extras",
            // v2 can only steal zeros
            small: |value| value == 0,
        }
    } else {
        PageWalk {
            delta_mask: layout.pointer_delta_mask,
            value_add,
            no_rebase: SLIDE4_PAGE_NO_REBASE,
            use_extra: SLIDE4_PAGE_USE_EXTRA,
            extra_end: SLIDE4_PAGE_EXTRA_END,
            extras_limit: SLIDE4_PAGE_INDEX - 1,
            extras_overflow_msg: "rebase overflow in v4 page extras",
            small: small_value,
        }
    }
}

/// Emit v2 or v4 slide info into the reservation at the start of the
/// read-only region, mutating the writable region's rebase slots to carry
/// the delta chains. Returns the final (aligned) size.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_slide_info_paged<P: SlidePointer>(
    version: u32,
    layout: &'static ArchLayout,
    rw: &mut [u8],
    slide_buf: &mut [u8],
    aslr: &AslrTracker,
    locate: &LocateFn<'_>,
    diag: &mut Diagnostics,
) -> Option<u64> {
    assert!(version == 2 || version == 4);
    let walk = paged_walk_for(version, layout, P::BYTES);
    let page_count = aslr.data_page_count();

    let mut page_starts: Vec<u16> = Vec::with_capacity(page_count);
    let mut page_extras: Vec<u16> = Vec::new();

    for (index, page) in rw.chunks_mut(PAGE_SIZE as usize).take(page_count).enumerate() {
        add_page_starts::<P>(
            page,
            index as u64 * PAGE_SIZE,
            aslr.page_bitmap(index),
            &walk,
            &mut page_starts,
            &mut page_extras,
            locate,
            diag,
        );
        if diag.has_error() {
            return None;
        }
    }

    let header_size = std::mem::size_of::<CacheSlideInfo2>();
    let info = CacheSlideInfo2 {
        version,
        page_size: PAGE_SIZE as u32,
        page_starts_offset: header_size as u32,
        page_starts_count: page_starts.len() as u32,
        page_extras_offset: (header_size + page_starts.len() * 2) as u32,
        page_extras_count: page_extras.len() as u32,
        delta_mask: walk.delta_mask,
        value_add: walk.value_add,
    };

    let final_size = align(
        info.page_extras_offset as u64 + page_extras.len() as u64 * 2,
        layout.shared_region_align_p2,
    );
    if final_size > slide_buf.len() as u64 {
        diag.error(BuildError::SlideInfoOverflow("kernel slide info overflow buffer"));
        return None;
    }

    slide_buf[..header_size].copy_from_slice(struct_bytes(&info));
    let mut offset = header_size;
    for &value in page_starts.iter().chain(page_extras.iter()) {
        slide_buf
            .pwrite_with::<u16>(value, offset, LE)
            .expect("slide info within reservation");
        offset += 2;
    }
    Some(final_size)
}

/// Set a chained-fixup entry's next field (11 bits, 8-byte strides).
fn set_chain_next(page: &mut [u8], offset: usize, next: u64) {
    const NEXT_SHIFT: u32 = 51;
    const NEXT_MASK: u64 = 0x7FF;
    let raw = Pointer64::get(page, offset);
    let new = (raw & !(NEXT_MASK << NEXT_SHIFT)) | ((next & NEXT_MASK) << NEXT_SHIFT);
    Pointer64::set(page, offset, new);
}

/// One page of the v3 walk: the region already holds chained-fixup
/// pointers, so only each entry's next link is recomputed (the original
/// chain may be wrong after segment packing).
fn page_start_v3(page: &mut [u8], bitmap: &[bool]) -> u16 {
    let mut result = SLIDE_V3_PAGE_ATTR_NO_REBASE;
    let mut last: Option<usize> = None;
    for (i, &set) in bitmap.iter().enumerate() {
        if !set {
            continue;
        }
        let offset = i * 4;
        if result == SLIDE_V3_PAGE_ATTR_NO_REBASE {
            result = offset as u16;
        }
        if let Some(last_offset) = last {
            set_chain_next(page, last_offset, ((offset - last_offset) / 8) as u64);
        }
        last = Some(offset);
    }
    if let Some(last_offset) = last {
        set_chain_next(page, last_offset, 0);
    }
    result
}

/// Emit v3 slide info (pointer-authentication archs). Returns the final
/// (aligned) size.
pub(crate) fn write_slide_info_v3(
    layout: &'static ArchLayout,
    rw: &mut [u8],
    slide_buf: &mut [u8],
    aslr: &AslrTracker,
    diag: &mut Diagnostics,
) -> Option<u64> {
    let page_count = aslr.data_page_count();
    let header_size = std::mem::size_of::<CacheSlideInfo3>();

    let info = CacheSlideInfo3 {
        version: 3,
        page_size: PAGE_SIZE as u32,
        page_starts_count: page_count as u32,
        auth_value_add: layout.shared_memory_start,
    };

    let final_size = align(
        header_size as u64 + page_count as u64 * 2,
        layout.shared_region_align_p2,
    );
    if final_size > slide_buf.len() as u64 {
        diag.error(BuildError::SlideInfoOverflow("kernel slide info overflow buffer"));
        return None;
    }

    slide_buf[..header_size].copy_from_slice(struct_bytes(&info));
    for (index, page) in rw.chunks_mut(PAGE_SIZE as usize).take(page_count).enumerate() {
        let start = page_start_v3(page, aslr.page_bitmap(index));
        slide_buf
            .pwrite_with::<u16>(start, header_size + index * 2, LE)
            .expect("slide info within reservation");
    }
    Some(final_size)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache_format::read_struct;

    const ALIGN_P2: u8 = 12;

    fn x86_64_layout() -> &'static ArchLayout {
        ArchLayout::for_arch("x86_64", false).unwrap()
    }

    fn armv7s_layout() -> &'static ArchLayout {
        ArchLayout::for_arch("armv7s", false).unwrap()
    }

    /// Reference decoder: applies the chain walk the loader performs and
    /// returns (offset, pointer value) for every slide site.
    fn decode_paged<P: SlidePointer>(info_bytes: &[u8], rw: &[u8]) -> Vec<(u64, u64)> {
        let info: CacheSlideInfo2 = read_struct(info_bytes, 0).unwrap();
        let delta_shift = info.delta_mask.trailing_zeros() - 2;
        let value_mask = !info.delta_mask;
        let (no_rebase, extra, end_bit) = if info.version == 2 {
            (SLIDE_PAGE_ATTR_NO_REBASE, SLIDE_PAGE_ATTR_EXTRA, SLIDE_PAGE_ATTR_END)
        } else {
            (SLIDE4_PAGE_NO_REBASE, SLIDE4_PAGE_USE_EXTRA, SLIDE4_PAGE_EXTRA_END)
        };
        let read_u16 = |off: usize| -> u16 { info_bytes.pread_with(off, LE).unwrap() };

        let mut sites = Vec::new();
        let mut walk_chain = |page_base: u64, first_slot: u16| {
            let mut offset = first_slot as u64 * 4;
            loop {
                let raw = P::get(rw, (page_base + offset) as usize);
                let value = raw & value_mask;
                // The loader leaves zeros (v2) and small signed values (v4,
                // which read as 0x3FFFxxxx once the delta bits are masked
                // off) unslid; everything else is a slide site.
                let is_site = if info.version == 2 {
                    value != 0
                } else {
                    (value & 0xFFFF_8000) != 0 && (value & 0x3FFF_8000) != 0x3FFF_8000
                };
                if is_site {
                    sites.push((page_base + offset, value + info.value_add));
                }
                let delta = (raw & info.delta_mask) >> delta_shift;
                if delta == 0 {
                    break;
                }
                offset += delta;
            }
        };

        for page in 0..info.page_starts_count as usize {
            let start = read_u16(info.page_starts_offset as usize + page * 2);
            let page_base = page as u64 * PAGE_SIZE;
            if start == no_rebase {
                continue;
            }
            if start & extra != 0 {
                let mut index = (start & !extra) as usize;
                loop {
                    let entry = read_u16(info.page_extras_offset as usize + index * 2);
                    walk_chain(page_base, entry & !end_bit);
                    if entry & end_bit != 0 {
                        break;
                    }
                    index += 1;
                }
            } else {
                walk_chain(page_base, start);
            }
        }
        sites
    }

    fn encode<P: SlidePointer>(
        version: u32,
        layout: &'static ArchLayout,
        rw: &mut [u8],
        aslr: &AslrTracker,
    ) -> (Vec<u8>, u64) {
        let mut slide_buf = vec![0u8; rw.len() + 0x1000];
        let mut diag = Diagnostics::default();
        let locate = |_: u64| ("???".to_owned(), "???".to_owned());
        let size = write_slide_info_paged::<P>(
            version, layout, rw, &mut slide_buf, aslr, &locate, &mut diag,
        )
        .unwrap_or_else(|| panic!("{}", diag.error_message()));
        (slide_buf, size)
    }

    #[test]
    fn v2_chain_round_trips() {
        let layout = x86_64_layout();
        let mut rw = vec![0u8; 0x2000];
        let mut aslr = AslrTracker::default();
        aslr.set_data_region(0x2000);

        let pointers = [(0x10u64, 0x7FFF_2000_0000u64), (0x58, 0x7FFF_2000_4000), (0x1FF8, 0x7FFF_2100_0000)];
        for &(offset, value) in &pointers {
            rw[offset as usize..offset as usize + 8].copy_from_slice(&value.to_le_bytes());
            aslr.add(offset);
        }

        let (info, size) = encode::<Pointer64>(2, layout, &mut rw, &aslr);
        assert_eq!(size % (1 << ALIGN_P2), 0);

        let sites = decode_paged::<Pointer64>(&info, &rw);
        assert_eq!(sites, pointers);
    }

    #[test]
    fn v2_distant_sites_use_extras_when_no_small_slot_exists() {
        let layout = x86_64_layout();
        // delta_mask 0xFFFF000000000000 reaches 0x3FFFC bytes, farther than
        // a page, so fill the gap with non-zero junk and shrink the mask by
        // using armv7s below instead for the hijack test. Here two sites on
        // one page always chain directly.
        let mut rw = vec![0u8; 0x1000];
        let mut aslr = AslrTracker::default();
        aslr.set_data_region(0x1000);
        rw[0..8].copy_from_slice(&0x7FFF_2000_0000u64.to_le_bytes());
        rw[0xFF8..0x1000].copy_from_slice(&0x7FFF_2000_0000u64.to_le_bytes());
        aslr.add(0);
        aslr.add(0xFF8);

        let (info, _) = encode::<Pointer64>(2, layout, &mut rw, &aslr);
        let header: CacheSlideInfo2 = read_struct(&info, 0).unwrap();
        assert_eq!(header.page_extras_count, 0);
        assert_eq!(decode_paged::<Pointer64>(&info, &rw).len(), 2);
    }

    #[test]
    fn v2_32bit_hijacks_zero_slots_or_falls_back_to_extras() {
        // armv7s: delta_mask 0xE0000000 -> max delta 28 bytes.
        let layout = armv7s_layout();
        let mut rw = vec![0u8; 0x1000];
        let mut aslr = AslrTracker::default();
        aslr.set_data_region(0x1000);

        let base = layout.shared_memory_start;
        // Two sites 0x100 apart; the gap is all zeros, so the chain can be
        // threaded through hijacked slots.
        rw[0x10..0x14].copy_from_slice(&(base as u32 + 0x40).to_le_bytes());
        rw[0x110..0x114].copy_from_slice(&(base as u32 + 0x80).to_le_bytes());
        aslr.add(0x10);
        aslr.add(0x110);
        // Two more sites 0x200 apart with a solid wall of non-zero,
        // non-rebase values in between: forces the extras pool.
        for offset in (0x400..0x600).step_by(4) {
            rw[offset..offset + 4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        }
        rw[0x3FC..0x400].copy_from_slice(&(base as u32 + 0xC0).to_le_bytes());
        rw[0x600..0x604].copy_from_slice(&(base as u32 + 0x100).to_le_bytes());
        aslr.add(0x3FC);
        aslr.add(0x600);

        let (info, _) = encode::<Pointer32>(2, layout, &mut rw, &aslr);
        let header: CacheSlideInfo2 = read_struct(&info, 0).unwrap();
        assert!(header.page_extras_count > 0);

        let mut sites = decode_paged::<Pointer32>(&info, &rw);
        sites.sort();
        assert_eq!(
            sites,
            [
                (0x10, base + 0x40),
                (0x110, base + 0x80),
                (0x3FC, base + 0xC0),
                (0x600, base + 0x100),
            ]
        );
    }

    #[test]
    fn v4_hijacks_small_values() {
        let layout = ArchLayout::for_arch("arm64_32", false).unwrap();
        let mut rw = vec![0u8; 0x1000];
        let mut aslr = AslrTracker::default();
        aslr.set_data_region(0x1000);

        let base = layout.shared_memory_start;
        // Gap filled with small negative values, unusable for v2 but fine
        // for v4's signed-16-bit hijack rule.
        for offset in (0x20..0x200).step_by(4) {
            rw[offset..offset + 4].copy_from_slice(&(-1i32 as u32).to_le_bytes());
        }
        rw[0x10..0x14].copy_from_slice(&(base as u32 + 0x40).to_le_bytes());
        rw[0x200..0x204].copy_from_slice(&(base as u32 + 0x80).to_le_bytes());
        aslr.add(0x10);
        aslr.add(0x200);

        let (info, _) = encode::<Pointer32>(4, layout, &mut rw, &aslr);
        let header: CacheSlideInfo2 = read_struct(&info, 0).unwrap();
        assert_eq!(header.version, 4);
        assert_eq!(header.page_extras_count, 0);

        let mut sites = decode_paged::<Pointer32>(&info, &rw);
        sites.sort();
        assert_eq!(sites, [(0x10, base + 0x40), (0x200, base + 0x80)]);
        // Hijacked slots keep their small negative value under the delta
        // bits, which the loader recognizes and sign-extends.
        let hijacked = u32::from_le_bytes(rw[0x1FC..0x200].try_into().unwrap()) as u64;
        assert_eq!(hijacked & !header.delta_mask & 0x3FFF_8000, 0x3FFF_8000);
    }

    #[test]
    fn v3_rewrites_chain_links() {
        let layout = ArchLayout::for_arch("arm64e", false).unwrap();
        let mut rw = vec![0u8; 0x1000];
        let mut aslr = AslrTracker::default();
        aslr.set_data_region(0x1000);

        // Chained pointers with stale next fields.
        let stale = (5u64 << 51) | 0x4000;
        for offset in [0x8usize, 0x40, 0x48] {
            rw[offset..offset + 8].copy_from_slice(&stale.to_le_bytes());
            aslr.add(offset as u64);
        }

        let mut slide_buf = vec![0u8; 0x4000];
        let mut diag = Diagnostics::default();
        let size =
            write_slide_info_v3(layout, &mut rw, &mut slide_buf, &aslr, &mut diag).unwrap();
        assert_eq!(size % (1 << layout.shared_region_align_p2), 0);

        let info: CacheSlideInfo3 = read_struct(&slide_buf, 0).unwrap();
        assert_eq!(info.version, 3);
        assert_eq!(info.page_starts_count, 1);
        let first: u16 = slide_buf
            .pread_with(std::mem::size_of::<CacheSlideInfo3>(), LE)
            .unwrap();
        assert_eq!(first, 0x8);

        // Walk the rewritten chain.
        let next_of = |off: usize| {
            (u64::from_le_bytes(rw[off..off + 8].try_into().unwrap()) >> 51) & 0x7FF
        };
        assert_eq!(next_of(0x8), (0x40 - 0x8) as u64 / 8);
        assert_eq!(next_of(0x40), 1);
        assert_eq!(next_of(0x48), 0);
    }

    #[test]
    fn undersized_reservation_is_fatal() {
        let layout = x86_64_layout();
        let mut rw = vec![0u8; 0x1000];
        let mut aslr = AslrTracker::default();
        aslr.set_data_region(0x1000);
        let mut slide_buf = vec![0u8; 8];
        let mut diag = Diagnostics::default();
        let locate = |_: u64| (String::new(), String::new());
        let out = write_slide_info_paged::<Pointer64>(
            2, layout, &mut rw, &mut slide_buf, &aslr, &locate, &mut diag,
        );
        assert!(out.is_none());
        assert!(diag.error_message().contains("overflow buffer"));
    }
}
