//! Production [`MachImage`] implementation on top of goblin.
//!
//! Parsing happens once, up front; the analyzer keeps owned copies of the
//! metadata the builder asks for so that nothing borrows the goblin parse.

use std::ops::Range;

use goblin::mach::constants::cputype::{
    CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86, CPU_TYPE_X86_64,
};
use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};

use crate::cache_format::VmProt;
use crate::filesystem::FileBytes;
use crate::images::{DependentDylib, MachFileKind, MachImage, SegmentInfo};

const CPU_SUBTYPE_MASK: u32 = 0xFF00_0000;
const CPU_SUBTYPE_X86_64_H: u32 = 8;
const CPU_SUBTYPE_ARM_V7S: u32 = 11;
const CPU_SUBTYPE_ARM_V7K: u32 = 12;
const CPU_SUBTYPE_ARM64E: u32 = 2;

#[derive(Debug)]
struct SectionRecord {
    segment: String,
    section: String,
    file_range: Range<usize>,
}

#[derive(Debug)]
pub struct MachAnalyzer {
    data: FileBytes,
    slice: Range<usize>,
    kind: MachFileKind,
    install_name: Option<String>,
    uuid: [u8; 16],
    segments: Vec<SegmentInfo>,
    dependents: Vec<DependentDylib>,
    sections: Vec<SectionRecord>,
}

/// `(cputype, required subtype)` for an architecture name; subtype `None`
/// accepts any slice of the right type.
fn cpu_for_arch(arch_name: &str) -> Result<(u32, Option<u32>), String> {
    Ok(match arch_name {
        "x86_64" => (CPU_TYPE_X86_64, None),
        "x86_64h" => (CPU_TYPE_X86_64, Some(CPU_SUBTYPE_X86_64_H)),
        "i386" | "sim-x86" => (CPU_TYPE_X86, None),
        "arm64" => (CPU_TYPE_ARM64, None),
        "arm64e" => (CPU_TYPE_ARM64, Some(CPU_SUBTYPE_ARM64E)),
        "arm64_32" => (CPU_TYPE_ARM64_32, None),
        "armv7s" => (CPU_TYPE_ARM, Some(CPU_SUBTYPE_ARM_V7S)),
        "armv7k" => (CPU_TYPE_ARM, Some(CPU_SUBTYPE_ARM_V7K)),
        other => return Err(format!("unknown architecture '{other}'")),
    })
}

fn matches_arch(cputype: u32, cpusubtype: u32, want: (u32, Option<u32>)) -> bool {
    cputype == want.0
        && match want.1 {
            Some(sub) => (cpusubtype & !CPU_SUBTYPE_MASK) == sub,
            None => true,
        }
}

impl MachAnalyzer {
    pub fn parse(data: FileBytes, arch_name: &str) -> Result<MachAnalyzer, String> {
        let want = cpu_for_arch(arch_name)?;

        let slice = match Mach::parse(&data).map_err(|e| format!("not a mach-o file: {e}"))? {
            Mach::Binary(macho) => {
                if !matches_arch(macho.header.cputype, macho.header.cpusubtype, want) {
                    return Err(format!("file does not contain a {arch_name} slice"));
                }
                0..data.len()
            }
            Mach::Fat(multi) => {
                let mut found = None;
                for arch in multi.iter_arches() {
                    let arch = arch.map_err(|e| format!("bad fat header: {e}"))?;
                    if matches_arch(arch.cputype, arch.cpusubtype, want) {
                        found = Some(
                            arch.offset as usize..(arch.offset as usize + arch.size as usize),
                        );
                        break;
                    }
                }
                found.ok_or_else(|| format!("file does not contain a {arch_name} slice"))?
            }
        };

        if slice.end > data.len() {
            return Err("fat slice extends past end of file".into());
        }

        let parsed = {
            let bytes = &data[slice.clone()];
            let macho =
                MachO::parse(bytes, 0).map_err(|e| format!("could not parse slice: {e}"))?;
            extract(&macho, bytes)?
        };

        Ok(MachAnalyzer {
            data,
            slice,
            kind: parsed.kind,
            install_name: parsed.install_name,
            uuid: parsed.uuid,
            segments: parsed.segments,
            dependents: parsed.dependents,
            sections: parsed.sections,
        })
    }

    pub fn slice_offset(&self) -> u64 {
        self.slice.start as u64
    }
}

struct Extracted {
    kind: MachFileKind,
    install_name: Option<String>,
    uuid: [u8; 16],
    segments: Vec<SegmentInfo>,
    dependents: Vec<DependentDylib>,
    sections: Vec<SectionRecord>,
}

/// Pull everything we keep out of the borrowed goblin parse.
fn extract(macho: &MachO<'_>, bytes: &[u8]) -> Result<Extracted, String> {
    let kind = match macho.header.filetype {
        MH_DYLIB => MachFileKind::Dylib,
        MH_BUNDLE => MachFileKind::Bundle,
        MH_EXECUTE => MachFileKind::DynamicExecutable,
        _ => MachFileKind::Other,
    };

    let mut install_name = None;
    let mut uuid = [0u8; 16];
    let mut dependents = Vec::new();

    for lc in &macho.load_commands {
        match &lc.command {
            CommandVariant::IdDylib(cmd) => {
                install_name = Some(dylib_name(bytes, lc.offset, cmd)?);
            }
            CommandVariant::LoadDylib(cmd) | CommandVariant::LazyLoadDylib(cmd) => {
                dependents.push(DependentDylib {
                    path: dylib_name(bytes, lc.offset, cmd)?,
                    weak: false,
                    re_export: false,
                    upward: false,
                });
            }
            CommandVariant::LoadWeakDylib(cmd) => {
                dependents.push(DependentDylib {
                    path: dylib_name(bytes, lc.offset, cmd)?,
                    weak: true,
                    re_export: false,
                    upward: false,
                });
            }
            CommandVariant::ReexportDylib(cmd) => {
                dependents.push(DependentDylib {
                    path: dylib_name(bytes, lc.offset, cmd)?,
                    weak: false,
                    re_export: true,
                    upward: false,
                });
            }
            CommandVariant::LoadUpwardDylib(cmd) => {
                dependents.push(DependentDylib {
                    path: dylib_name(bytes, lc.offset, cmd)?,
                    weak: false,
                    re_export: false,
                    upward: true,
                });
            }
            CommandVariant::Uuid(cmd) => uuid = cmd.uuid,
            _ => {}
        }
    }

    let mut segments = Vec::new();
    let mut sections = Vec::new();
    for (index, segment) in macho.segments.iter().enumerate() {
        let seg_name = segment
            .name()
            .map_err(|e| format!("bad segment name: {e}"))?
            .to_owned();

        let mut p2align = 3u8;
        let mut sections_end = 0u64;
        for (section, _) in segment
            .sections()
            .map_err(|e| format!("bad sections in {seg_name}: {e}"))?
        {
            p2align = p2align.max(section.align as u8);
            sections_end = sections_end.max(section.addr + section.size);
            let sect_name = section
                .name()
                .map_err(|e| format!("bad section name: {e}"))?
                .to_owned();
            let start = section.offset as usize;
            sections.push(SectionRecord {
                segment: seg_name.clone(),
                section: sect_name,
                file_range: start..start + section.size as usize,
            });
        }

        // Segments without sections (LINKEDIT) copy their file bytes.
        let size_of_sections = if segment.nsects == 0 {
            segment.filesize
        } else {
            sections_end.saturating_sub(segment.vmaddr)
        };

        segments.push(SegmentInfo {
            name: seg_name,
            vm_addr: segment.vmaddr,
            vm_size: segment.vmsize,
            file_size: segment.filesize,
            size_of_sections,
            p2align,
            protections: VmProt::from_bits_truncate(segment.initprot),
            index: index as u32,
        });
    }

    Ok(Extracted {
        kind,
        install_name,
        uuid,
        segments,
        dependents,
        sections,
    })
}

/// Read the NUL-terminated path out of a dylib load command.
fn dylib_name(
    bytes: &[u8],
    command_offset: usize,
    cmd: &goblin::mach::load_command::DylibCommand,
) -> Result<String, String> {
    let start = command_offset + cmd.dylib.name as usize;
    let end = command_offset + cmd.cmdsize as usize;
    let raw = bytes
        .get(start..end.min(bytes.len()))
        .ok_or("dylib name outside load command")?;
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..nul])
        .map(str::to_owned)
        .map_err(|e| format!("dylib name is not utf-8: {e}"))
}

impl MachImage for MachAnalyzer {
    fn bytes(&self) -> &[u8] {
        &self.data[self.slice.clone()]
    }

    fn file_kind(&self) -> MachFileKind {
        self.kind
    }

    fn install_name(&self) -> Option<&str> {
        self.install_name.as_deref()
    }

    fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.clone()
    }

    fn dependents(&self) -> Vec<DependentDylib> {
        self.dependents.clone()
    }

    fn section_bytes(&self, segment: &str, section: &str) -> Option<&[u8]> {
        let record = self
            .sections
            .iter()
            .find(|s| s.segment == segment && s.section == section)?;
        self.bytes().get(record.file_range.clone())
    }

    fn placeable_in_cache(&self) -> Result<(), String> {
        match self.install_name.as_deref() {
            None => return Err("no install name".into()),
            Some(name) if !name.starts_with('/') => {
                return Err("install name is not an absolute path".into());
            }
            Some(_) => {}
        }
        if !self.segments.iter().any(|s| s.name == "__TEXT") {
            return Err("no __TEXT segment".into());
        }
        for segment in &self.segments {
            if segment
                .protections
                .contains(VmProt::WRITE | VmProt::EXECUTE)
            {
                return Err(format!("segment {} is writable and executable", segment.name));
            }
        }
        Ok(())
    }
}
