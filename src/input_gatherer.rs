//! Classifies raw input files into cache candidates, other images,
//! executables, and files that could not be loaded at all.

use std::collections::HashMap;

use crate::diagnostics::Diagnostics;
use crate::images::{FileSystem, MachFileKind, MachImage};

/// Platform the cache targets; numbering matches the loader's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Platform {
    Unknown = 0,
    MacOs = 1,
    Ios = 2,
    TvOs = 3,
    WatchOs = 4,
    BridgeOs = 5,
    IosMac = 6,
    IosSimulator = 7,
    TvOsSimulator = 8,
    WatchOsSimulator = 9,
}

/// Caller-assigned disposition of one input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InclusionState {
    #[default]
    Unset,
    MustBeIncluded,
    /// Set transitively on the dependencies of a `MustBeIncluded` input so
    /// the front end can report precisely why a removal is fatal.
    MustBeIncludedForDependent,
    /// Evict this dylib if nothing in the cache depends on it.
    MustBeExcludedIfUnused,
}

#[derive(Debug)]
pub struct InputFile {
    pub path: String,
    pub state: InclusionState,
    pub diag: Diagnostics,
}

impl InputFile {
    pub fn new(path: impl Into<String>) -> Self {
        InputFile {
            path: path.into(),
            state: InclusionState::Unset,
            diag: Diagnostics::default(),
        }
    }

    pub fn with_state(path: impl Into<String>, state: InclusionState) -> Self {
        InputFile {
            path: path.into(),
            state,
            diag: Diagnostics::default(),
        }
    }

    pub fn must_be_included(&self) -> bool {
        matches!(
            self.state,
            InclusionState::MustBeIncluded | InclusionState::MustBeIncludedForDependent
        )
    }
}

/// An input that loaded successfully for the requested architecture.
pub struct LoadedImage {
    pub image: Box<dyn MachImage>,
    pub runtime_path: String,
    pub slice_offset: u64,
    pub mtime: u64,
    pub inode: u64,
    /// Index into the caller's input list, when the image came from one.
    pub input: Option<usize>,
}

impl LoadedImage {
    pub fn install_name(&self) -> &str {
        self.image.install_name().unwrap_or(&self.runtime_path)
    }
}

#[derive(Default)]
pub struct ClassifiedInputs {
    pub dylibs_to_cache: Vec<LoadedImage>,
    pub other_dylibs: Vec<LoadedImage>,
    pub executables: Vec<LoadedImage>,
    /// Indices of inputs that could not be loaded; the reason is in each
    /// input's own diagnostics.
    pub could_not_load: Vec<usize>,
}

/// Load and classify every input file.
pub fn gather_inputs(
    file_system: &dyn FileSystem,
    arch_name: &str,
    platform: Platform,
    inputs: &mut [InputFile],
) -> ClassifiedInputs {
    let mut out = ClassifiedInputs::default();
    // install name -> index into dylibs_to_cache
    let mut install_name_map: HashMap<String, usize> = HashMap::new();

    for (index, input) in inputs.iter_mut().enumerate() {
        let loaded = match file_system.load(&input.path, arch_name) {
            Ok(loaded) => loaded,
            Err(reason) => {
                input.diag.warning(reason);
                out.could_not_load.push(index);
                continue;
            }
        };

        let image = LoadedImage {
            runtime_path: input.path.clone(),
            slice_offset: loaded.slice_offset,
            mtime: loaded.mtime,
            inode: loaded.inode,
            image: loaded.image,
            input: Some(index),
        };

        match image.image.file_kind() {
            MachFileKind::Dylib => {
                let install_name = image.image.install_name().map(str::to_owned);
                let Some(install_name) = install_name else {
                    input
                        .diag
                        .warning(format!("Dylib located at '{}' has no install name", input.path));
                    out.other_dylibs.push(image);
                    continue;
                };

                // The platform exclusion list overrides everything else.
                if platform_excludes_install_name(platform, &install_name) {
                    input.diag.verbose("Platform excluded file");
                    continue;
                }

                if let Err(reason) = image.image.placeable_in_cache() {
                    input.diag.warning(format!(
                        "Dylib located at '{}' cannot be placed in cache because: {}",
                        input.path, reason
                    ));
                    out.other_dylibs.push(image);
                    continue;
                }

                match install_name_map.entry(install_name.clone()) {
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        if !install_name.starts_with('@') && install_name != input.path {
                            input.diag.warning(format!(
                                "Dylib located at '{}' has installname '{}'",
                                input.path, install_name
                            ));
                        }
                        entry.insert(out.dylibs_to_cache.len());
                        out.dylibs_to_cache.push(image);
                    }
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        let previous = &mut out.dylibs_to_cache[*entry.get()];
                        input.diag.warning(format!(
                            "Multiple dylibs claim installname '{}' ('{}' and '{}')",
                            install_name, input.path, previous.runtime_path
                        ));
                        // The one whose path matches its install name wins;
                        // otherwise first seen stays.
                        if input.path == install_name {
                            *previous = image;
                        }
                    }
                }
            }
            MachFileKind::Bundle => {
                out.other_dylibs.push(image);
            }
            MachFileKind::DynamicExecutable => {
                if platform_excludes_executable_path(platform, &input.path) {
                    input.diag.verbose("Platform excluded file");
                    continue;
                }
                out.executables.push(image);
            }
            MachFileKind::Other => {
                input.diag.verbose("Unsupported mach file type");
            }
        }
    }

    out
}

/// Install names the handheld platforms never allow into the cache.
fn platform_excludes_install_name(platform: Platform, install_name: &str) -> bool {
    match platform {
        Platform::Ios | Platform::TvOs | Platform::WatchOs | Platform::BridgeOs => {
            install_name == "/System/Library/Caches/com.apple.xpc/sdk.dylib"
                || install_name == "/System/Library/Caches/com.apple.xpcd/xpcd_cache.dylib"
        }
        _ => false,
    }
}

/// Executables the handheld platforms exclude: launchd and installd
/// variants, which must keep working before the cache exists.
fn platform_excludes_executable_path(platform: Platform, path: &str) -> bool {
    match platform {
        Platform::Ios | Platform::TvOs | Platform::WatchOs | Platform::BridgeOs => {
            path == "/sbin/launchd"
                || path == "/usr/local/sbin/launchd.debug"
                || path == "/usr/local/sbin/launchd.development"
                || path == "/usr/libexec/installd"
        }
        _ => false,
    }
}
