//! Offline builder for shared-cache images.
//!
//! Takes a set of final-linked dylibs for one architecture and packs them
//! into a single contiguous, memory-mappable cache file: three mapped
//! regions (read+execute, read+write, read-only), a compact slide-info
//! side table for whole-cache kernel slide, and an appended ad-hoc code
//! signature from which the cache UUID is derived.
//!
//! Mach-O parsing, per-image fixup rewriting, and closure building are
//! external collaborators consumed through the traits in [`images`] and
//! [`fixups`]; production implementations backed by goblin and mmap live
//! in [`macho_analyzer`] and [`filesystem`].

pub mod arch;
pub mod aslr_tracker;
pub mod cache_builder;
pub mod cache_format;
pub mod cache_writer;
pub mod code_signer;
pub mod diagnostics;
pub mod errors;
pub mod filesystem;
pub mod fixups;
pub mod images;
pub mod input_gatherer;
pub mod macho_analyzer;
pub mod self_contained;
pub mod slide_info;

pub use cache_builder::{CacheBuilder, Collaborators, CreateOptions, FileAlias, MIN_CACHED_DYLIBS};
pub use code_signer::SigningDigestMode;
pub use errors::BuildError;
pub use input_gatherer::{InclusionState, InputFile, LoadedImage, Platform};
