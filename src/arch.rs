//! Per-architecture layout constants.
//!
//! Every arch-dependent number the builder consults lives in one
//! [`ArchLayout`] record: where the shared region sits, how big it is, how
//! pointers encode slide-chain deltas, and how far a branch instruction can
//! reach before a veneer pool is needed.

/// Immutable per-architecture profile.
#[derive(Debug)]
pub struct ArchLayout {
    /// Unslid base address of the shared region.
    pub shared_memory_start: u64,
    /// Span of the shared region; the whole cache must fit inside it.
    pub shared_memory_size: u64,
    /// Gap inserted between regions on contiguous layouts.
    pub shared_region_padding: u64,
    /// In-pointer bits used to thread slide chains (v2/v4 slide info).
    pub pointer_delta_mask: u64,
    pub arch_name: &'static str,
    /// Text bytes reserved per branch pool; zero when the arch has no
    /// branch-reach limit.
    pub branch_pool_text_size: u64,
    /// LINKEDIT bytes reserved per branch pool.
    pub branch_pool_linkedit_size: u64,
    /// Maximum distance a branch can cover; zero when unlimited.
    pub branch_reach: u64,
    /// Alignment of region boundaries, as a power of two.
    pub shared_region_align_p2: u8,
    /// Worst-case slide-info bytes per 4 KiB page of writable data.
    pub slide_info_bytes_per_page: u32,
    /// x86_64 packs each region into its own fixed 1 GiB span.
    pub regions_are_discontiguous: bool,
    pub is_64: bool,
    /// Whether the kernel slides this cache at map-in (i386 and the
    /// simulator profile are never slid).
    pub supports_aslr: bool,
}

const ARM_SHARED_REGION_START: u64 = 0x1A00_0000;
const ARM_SHARED_REGION_SIZE: u64 = 0x2600_0000;
const ARM64_SHARED_REGION_START: u64 = 0x1_8000_0000;
const ARM64_SHARED_REGION_SIZE: u64 = 0x4000_0000;

#[rustfmt::skip]
static ARCH_LAYOUTS: &[ArchLayout] = &[
    ArchLayout { shared_memory_start: 0x7FFF_2000_0000, shared_memory_size: 0xEFE0_0000, shared_region_padding: 0x4000_0000, pointer_delta_mask: 0xFFFF_0000_0000_0000, arch_name: "x86_64",   branch_pool_text_size: 0,      branch_pool_linkedit_size: 0,         branch_reach: 0,          shared_region_align_p2: 12, slide_info_bytes_per_page: 2, regions_are_discontiguous: true,  is_64: true,  supports_aslr: true  },
    ArchLayout { shared_memory_start: 0x7FFF_2000_0000, shared_memory_size: 0xEFE0_0000, shared_region_padding: 0x4000_0000, pointer_delta_mask: 0xFFFF_0000_0000_0000, arch_name: "x86_64h",  branch_pool_text_size: 0,      branch_pool_linkedit_size: 0,         branch_reach: 0,          shared_region_align_p2: 12, slide_info_bytes_per_page: 2, regions_are_discontiguous: true,  is_64: true,  supports_aslr: true  },
    ArchLayout { shared_memory_start: 0x9000_0000,      shared_memory_size: 0x2000_0000, shared_region_padding: 0x0020_0000, pointer_delta_mask: 0x0,                  arch_name: "i386",     branch_pool_text_size: 0,      branch_pool_linkedit_size: 0,         branch_reach: 0,          shared_region_align_p2: 12, slide_info_bytes_per_page: 0, regions_are_discontiguous: false, is_64: false, supports_aslr: false },
    ArchLayout { shared_memory_start: ARM64_SHARED_REGION_START, shared_memory_size: ARM64_SHARED_REGION_SIZE, shared_region_padding: 0x0200_0000, pointer_delta_mask: 0x00FF_FF00_0000_0000, arch_name: "arm64",    branch_pool_text_size: 0xC000, branch_pool_linkedit_size: 0x0010_0000, branch_reach: 0x07F0_0000, shared_region_align_p2: 14, slide_info_bytes_per_page: 2, regions_are_discontiguous: false, is_64: true,  supports_aslr: true  },
    ArchLayout { shared_memory_start: ARM64_SHARED_REGION_START, shared_memory_size: ARM64_SHARED_REGION_SIZE, shared_region_padding: 0x0200_0000, pointer_delta_mask: 0x00FF_FF00_0000_0000, arch_name: "arm64e",   branch_pool_text_size: 0xC000, branch_pool_linkedit_size: 0x0010_0000, branch_reach: 0x07F0_0000, shared_region_align_p2: 14, slide_info_bytes_per_page: 2, regions_are_discontiguous: false, is_64: true,  supports_aslr: true  },
    ArchLayout { shared_memory_start: ARM_SHARED_REGION_START,   shared_memory_size: ARM_SHARED_REGION_SIZE,   shared_region_padding: 0x0200_0000, pointer_delta_mask: 0xC000_0000,           arch_name: "arm64_32", branch_pool_text_size: 0xC000, branch_pool_linkedit_size: 0x0010_0000, branch_reach: 0x07F0_0000, shared_region_align_p2: 14, slide_info_bytes_per_page: 6, regions_are_discontiguous: false, is_64: false, supports_aslr: true  },
    ArchLayout { shared_memory_start: ARM_SHARED_REGION_START,   shared_memory_size: ARM_SHARED_REGION_SIZE,   shared_region_padding: 0x0200_0000, pointer_delta_mask: 0xE000_0000,           arch_name: "armv7s",   branch_pool_text_size: 0,      branch_pool_linkedit_size: 0,         branch_reach: 0,          shared_region_align_p2: 14, slide_info_bytes_per_page: 4, regions_are_discontiguous: false, is_64: false, supports_aslr: true  },
    ArchLayout { shared_memory_start: ARM_SHARED_REGION_START,   shared_memory_size: ARM_SHARED_REGION_SIZE,   shared_region_padding: 0x0040_0000, pointer_delta_mask: 0xE000_0000,           arch_name: "armv7k",   branch_pool_text_size: 0,      branch_pool_linkedit_size: 0,         branch_reach: 0,          shared_region_align_p2: 14, slide_info_bytes_per_page: 4, regions_are_discontiguous: false, is_64: false, supports_aslr: true  },
    ArchLayout { shared_memory_start: 0x4000_0000,      shared_memory_size: 0x4000_0000, shared_region_padding: 0x0200_0000, pointer_delta_mask: 0x0,                  arch_name: "sim-x86",  branch_pool_text_size: 0,      branch_pool_linkedit_size: 0,         branch_reach: 0,          shared_region_align_p2: 14, slide_info_bytes_per_page: 0, regions_are_discontiguous: false, is_64: false, supports_aslr: false },
];

impl ArchLayout {
    /// Look up the profile for an architecture name. The 32-bit simulator
    /// maps to its own synthetic profile; an unknown name returns `None`
    /// (fatal to the build).
    pub fn for_arch(arch_name: &str, for_simulator: bool) -> Option<&'static ArchLayout> {
        let target = if for_simulator && arch_name == "i386" {
            "sim-x86"
        } else {
            arch_name
        };
        ARCH_LAYOUTS.iter().find(|l| l.arch_name == target)
    }

    pub fn pointer_size(&self) -> u64 {
        if self.is_64 { 8 } else { 4 }
    }
}

/// Round `value` up to a `2^p2align` boundary.
pub(crate) fn align(value: u64, p2align: u8) -> u64 {
    let mask = (1u64 << p2align) - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_arches_resolve() {
        for name in ["x86_64", "x86_64h", "i386", "arm64", "arm64e", "arm64_32", "armv7s", "armv7k"] {
            assert!(ArchLayout::for_arch(name, false).is_some(), "{name}");
        }
        assert!(ArchLayout::for_arch("riscv64", false).is_none());
    }

    #[test]
    fn simulator_alias() {
        let sim = ArchLayout::for_arch("i386", true).unwrap();
        assert_eq!(sim.arch_name, "sim-x86");
        let real = ArchLayout::for_arch("i386", false).unwrap();
        assert_eq!(real.arch_name, "i386");
        // The alias only exists for the 32-bit variant.
        assert_eq!(ArchLayout::for_arch("x86_64", true).unwrap().arch_name, "x86_64");
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align(0, 12), 0);
        assert_eq!(align(1, 12), 0x1000);
        assert_eq!(align(0x1000, 12), 0x1000);
        assert_eq!(align(0x4001, 14), 0x8000);
    }
}
