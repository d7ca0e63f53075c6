//! Synthetic images for driving the builder without fixture binaries.

use std::collections::HashMap;
use std::ops::Range;

use dyld_cache_builder::cache_format::VmProt;
use dyld_cache_builder::images::{
    DependentDylib, FileSystem, LoadedFile, MachFileKind, MachImage, SegmentInfo,
};
use dyld_cache_builder::input_gatherer::LoadedImage;

#[derive(Clone)]
pub struct FakeImage {
    pub install_name: Option<String>,
    pub kind: MachFileKind,
    pub uuid: [u8; 16],
    pub segments: Vec<SegmentInfo>,
    pub deps: Vec<DependentDylib>,
    pub sections: Vec<(String, String, Range<usize>)>,
    pub bytes: Vec<u8>,
    pub unplaceable_reason: Option<String>,
}

impl MachImage for FakeImage {
    fn bytes(&self) -> &[u8] {
        &self.bytes
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
        self.deps.clone()
    }

    fn section_bytes(&self, segment: &str, section: &str) -> Option<&[u8]> {
        let (_, _, range) = self
            .sections
            .iter()
            .find(|(seg, sect, _)| seg == segment && sect == section)?;
        self.bytes.get(range.clone())
    }

    fn placeable_in_cache(&self) -> Result<(), String> {
        match &self.unplaceable_reason {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// A dylib with one page each of __TEXT, __DATA, and __LINKEDIT, filled
/// with a per-name byte pattern so different dylibs have different
/// content.
pub fn minimal_dylib(install_name: &str) -> FakeImage {
    dylib_with_sizes(install_name, 0x1000, 0x1000)
}

pub fn dylib_with_sizes(install_name: &str, text_size: u64, data_size: u64) -> FakeImage {
    let linkedit_size = 0x1000u64;
    let segments = vec![
        SegmentInfo {
            name: "__TEXT".into(),
            vm_addr: 0,
            vm_size: text_size,
            file_size: text_size,
            size_of_sections: text_size,
            p2align: 12,
            protections: VmProt::READ | VmProt::EXECUTE,
            index: 0,
        },
        SegmentInfo {
            name: "__DATA".into(),
            vm_addr: text_size,
            vm_size: data_size,
            file_size: data_size,
            size_of_sections: data_size,
            p2align: 12,
            protections: VmProt::READ | VmProt::WRITE,
            index: 1,
        },
        SegmentInfo {
            name: "__LINKEDIT".into(),
            vm_addr: text_size + data_size,
            vm_size: linkedit_size,
            file_size: linkedit_size,
            size_of_sections: linkedit_size,
            p2align: 3,
            protections: VmProt::READ,
            index: 2,
        },
    ];

    let total = (text_size + data_size + linkedit_size) as usize;
    let name_bytes = install_name.as_bytes();
    let mut bytes = vec![0u8; total];
    // Only the text and linkedit carry a pattern; data stays zero so slide
    // chains can hijack slots freely.
    for (i, byte) in bytes[..text_size as usize].iter_mut().enumerate() {
        *byte = name_bytes[i % name_bytes.len()];
    }

    let mut uuid = [0u8; 16];
    for (i, byte) in name_bytes.iter().enumerate() {
        uuid[i % 16] ^= *byte;
    }

    FakeImage {
        install_name: Some(install_name.to_owned()),
        kind: MachFileKind::Dylib,
        uuid,
        segments,
        deps: Vec::new(),
        sections: Vec::new(),
        bytes,
        unplaceable_reason: None,
    }
}

pub fn loaded(image: FakeImage, runtime_path: &str) -> LoadedImage {
    LoadedImage {
        image: Box::new(image),
        runtime_path: runtime_path.to_owned(),
        slice_offset: 0,
        mtime: 1_600_000_000,
        inode: runtime_path.len() as u64 + 7,
        input: None,
    }
}

/// Thirty interchangeable dylibs, the admission minimum.
pub fn base_dylib_set() -> Vec<LoadedImage> {
    (0..30)
        .map(|i| {
            let name = format!("/usr/lib/liba{i:02}.dylib");
            loaded(minimal_dylib(&name), &name)
        })
        .collect()
}

/// In-memory file system serving fake images by path.
#[derive(Default)]
pub struct FakeFileSystem {
    pub files: HashMap<String, FakeImage>,
}

impl FakeFileSystem {
    pub fn with_minimal_dylibs(paths: &[String]) -> FakeFileSystem {
        let mut fs = FakeFileSystem::default();
        for path in paths {
            fs.files.insert(path.clone(), minimal_dylib(path));
        }
        fs
    }

    pub fn insert(&mut self, path: &str, image: FakeImage) {
        self.files.insert(path.to_owned(), image);
    }
}

impl FileSystem for FakeFileSystem {
    fn load(&self, path: &str, _arch_name: &str) -> Result<LoadedFile, String> {
        let image = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| format!("could not open '{path}': no such file"))?;
        Ok(LoadedFile {
            image: Box::new(image),
            slice_offset: 0,
            mtime: 1_600_000_000,
            inode: path.len() as u64 + 7,
        })
    }

    fn file_exists(&self, path: &str) -> (bool, bool) {
        (self.files.contains_key(path), false)
    }
}
