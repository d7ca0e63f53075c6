mod common;

use common::{FakeFileSystem, base_dylib_set, dylib_with_sizes, loaded, minimal_dylib};
use dyld_cache_builder::cache_format::{CacheHeader, VmProt};
use dyld_cache_builder::images::{DependentDylib, MachFileKind, TextSealer};
use dyld_cache_builder::{
    CacheBuilder, Collaborators, CreateOptions, InclusionState, InputFile, Platform,
    SigningDigestMode,
};

const ARM64_BASE: u64 = 0x1_8000_0000;

fn options() -> CreateOptions {
    CreateOptions {
        arch_name: "arm64".into(),
        platform: Platform::MacOs,
        code_signing_digest_mode: SigningDigestMode::Sha256Only,
        ..CreateOptions::default()
    }
}

fn read_cstr(buffer: &[u8], offset: usize) -> &str {
    let end = buffer[offset..].iter().position(|&b| b == 0).unwrap() + offset;
    std::str::from_utf8(&buffer[offset..end]).unwrap()
}

#[test]
fn thirty_minimal_dylibs_build_a_cache() {
    let mut builder = CacheBuilder::new(options());
    builder.build(base_dylib_set(), &[], &Collaborators::default());
    assert_eq!(builder.error_message(), "");
    assert_eq!(builder.cache_overflow_amount(), 0);

    let buffer = builder.write_buffer();
    let header = CacheHeader::read_from(&buffer).expect("readable header");

    // "dyld_v1" padded with spaces, arch name ending at byte 15
    assert_eq!(&header.magic[..7], b"dyld_v1");
    assert_eq!(&header.magic[10..15], b"arm64");
    assert_eq!(header.magic[15], 0);

    assert_eq!(header.mapping_count, 3);
    let mappings = header.mappings(&buffer).unwrap();
    assert_eq!(mappings[0].init_prot, (VmProt::READ | VmProt::EXECUTE).bits());
    assert_eq!(mappings[1].init_prot, (VmProt::READ | VmProt::WRITE).bits());
    assert_eq!(mappings[2].init_prot, VmProt::READ.bits());

    // file offsets accumulate region sizes
    assert_eq!(mappings[0].file_offset, 0);
    assert_eq!(mappings[1].file_offset, mappings[0].size);
    assert_eq!(mappings[2].file_offset, mappings[0].size + mappings[1].size);
    assert_eq!(
        header.code_signature_offset,
        mappings[2].file_offset + mappings[2].size
    );
    assert_eq!(
        buffer.len() as u64,
        header.code_signature_offset + header.code_signature_size
    );

    assert_eq!(header.shared_region_start, ARM64_BASE);
    assert_eq!(header.shared_region_size, 0x4000_0000);
    assert!(header.max_slide > 0);
    assert_ne!(header.uuid, [0u8; 16]);

    // all thirty dylibs present, at increasing page-aligned addresses,
    // with their install names in the header string pool
    assert_eq!(header.images_count, 30);
    let images = header.images(&buffer).unwrap();
    let mut last_address = 0;
    for (index, image) in images.iter().enumerate() {
        assert!(image.address > last_address);
        assert_eq!(image.address % 0x1000, 0);
        last_address = image.address;
        let name = read_cstr(&buffer, image.path_file_offset as usize);
        assert_eq!(name, format!("/usr/lib/liba{index:02}.dylib"));
    }

    let texts = header.images_text(&buffer).unwrap();
    assert_eq!(texts.len(), 30);
    for (image, text) in images.iter().zip(&texts) {
        assert_eq!(image.address, text.load_address);
        assert_eq!(image.path_file_offset, text.path_offset);
    }

    // slide info was reserved and emitted even with nothing to rebase
    assert_ne!(header.slide_info_offset, 0);
    assert_ne!(header.slide_info_size, 0);
}

#[test]
fn too_few_dylibs_is_fatal() {
    let mut builder = CacheBuilder::new(options());
    let dylibs = base_dylib_set().into_iter().take(5).collect();
    builder.build(dylibs, &[], &Collaborators::default());
    assert!(
        builder
            .error_message()
            .contains("missing required minimum set of dylibs")
    );
}

fn oversized_leaf() -> dyld_cache_builder::LoadedImage {
    // Declares over a gigabyte of text but backs it with a few pages; the
    // leaf is never copied because either the build fails or the leaf is
    // evicted first.
    let mut image = dylib_with_sizes("/usr/lib/libhuge.dylib", 0x1000, 0x1000);
    image.segments[0].vm_size = 0x4300_0000;
    image.segments[0].file_size = 0x4300_0000;
    image.segments[0].size_of_sections = 0x4300_0000;
    image.segments[1].vm_addr = 0x4300_0000;
    image.segments[2].vm_addr = 0x4300_1000;
    loaded(image, "/usr/lib/libhuge.dylib")
}

#[test]
fn overflow_without_eviction_fails_with_megabytes() {
    let mut builder = CacheBuilder::new(CreateOptions {
        evict_leaf_dylibs_on_overflow: false,
        ..options()
    });
    let mut dylibs = base_dylib_set();
    dylibs.push(oversized_leaf());
    builder.build(dylibs, &[], &Collaborators::default());

    let message = builder.error_message();
    let megabytes: u64 = message
        .strip_prefix("cache overflow by ")
        .and_then(|rest| rest.strip_suffix("MB"))
        .unwrap_or_else(|| panic!("unexpected error: {message}"))
        .parse()
        .unwrap();
    assert!(megabytes >= 32, "{message}");
}

#[test]
fn overflow_with_eviction_drops_the_unreferenced_leaf() {
    let mut builder = CacheBuilder::new(CreateOptions {
        evict_leaf_dylibs_on_overflow: true,
        ..options()
    });
    let mut dylibs = base_dylib_set();
    dylibs.push(oversized_leaf());
    builder.build(dylibs, &[], &Collaborators::default());

    assert_eq!(builder.error_message(), "");
    assert!(builder.evictions().contains("/usr/lib/libhuge.dylib"));
    assert_eq!(builder.cache_overflow_amount(), 0);

    let buffer = builder.write_buffer();
    let header = CacheHeader::read_from(&buffer).unwrap();
    assert_eq!(header.images_count, 30);
}

#[test]
fn duplicate_install_name_prefers_the_matching_path() {
    let paths: Vec<String> = (0..30)
        .map(|i| format!("/usr/lib/liba{i:02}.dylib"))
        .collect();
    let mut fs = FakeFileSystem::with_minimal_dylibs(&paths);

    // Two files claim /usr/lib/libx.dylib; only one lives there.
    let mut stray = minimal_dylib("/usr/lib/libx.dylib");
    stray.uuid[0] = 0xAA;
    fs.insert("/tmp/libx.dylib", stray);
    fs.insert("/usr/lib/libx.dylib", minimal_dylib("/usr/lib/libx.dylib"));

    let mut inputs: Vec<InputFile> = paths.iter().map(InputFile::new).collect();
    // The stray path comes first so the dedup really has to replace it.
    inputs.push(InputFile::new("/tmp/libx.dylib"));
    inputs.push(InputFile::new("/usr/lib/libx.dylib"));

    let mut builder = CacheBuilder::new(options());
    builder.build_from_files(&fs, &mut inputs, &[], &Collaborators::default());

    assert_eq!(builder.error_message(), "");
    assert!(builder.warnings().iter().any(|w| {
        w.contains("Multiple dylibs claim installname '/usr/lib/libx.dylib'")
            && w.contains("/tmp/libx.dylib")
            && w.contains("/usr/lib/libx.dylib")
    }));

    let buffer = builder.write_buffer();
    let header = CacheHeader::read_from(&buffer).unwrap();
    assert_eq!(header.images_count, 31);
    // The winner is the copy whose filesystem path matched: the fake file
    // system derives inode from the path length.
    let images = header.images(&buffer).unwrap();
    let libx = images
        .iter()
        .find(|img| read_cstr(&buffer, img.path_file_offset as usize) == "/usr/lib/libx.dylib")
        .expect("libx admitted");
    assert_eq!(libx.inode, "/usr/lib/libx.dylib".len() as u64 + 7);
}

#[test]
fn missing_dependency_demotes_without_failing_the_build() {
    let paths: Vec<String> = (0..30)
        .map(|i| format!("/usr/lib/liba{i:02}.dylib"))
        .collect();
    let mut fs = FakeFileSystem::with_minimal_dylibs(&paths);

    let mut broken = minimal_dylib("/usr/lib/libbroken.dylib");
    broken.deps.push(DependentDylib {
        path: "/usr/lib/libmissing.dylib".into(),
        weak: false,
        re_export: false,
        upward: false,
    });
    fs.insert("/usr/lib/libbroken.dylib", broken);

    let mut inputs: Vec<InputFile> = paths.iter().map(InputFile::new).collect();
    inputs.push(InputFile::new("/usr/lib/libbroken.dylib"));

    let mut builder = CacheBuilder::new(options());
    builder.build_from_files(&fs, &mut inputs, &[], &Collaborators::default());

    assert_eq!(builder.error_message(), "");
    assert!(
        builder
            .warnings()
            .iter()
            .any(|w| w.contains("Could not find dependency '/usr/lib/libmissing.dylib'"))
    );

    let buffer = builder.write_buffer();
    let header = CacheHeader::read_from(&buffer).unwrap();
    assert_eq!(header.images_count, 30);
}

#[test]
fn missing_dependency_of_required_dylib_is_fatal() {
    let paths: Vec<String> = (0..30)
        .map(|i| format!("/usr/lib/liba{i:02}.dylib"))
        .collect();
    let mut fs = FakeFileSystem::with_minimal_dylibs(&paths);

    let mut broken = minimal_dylib("/usr/lib/libbroken.dylib");
    broken.deps.push(DependentDylib {
        path: "/usr/lib/libmissing.dylib".into(),
        weak: false,
        re_export: false,
        upward: false,
    });
    fs.insert("/usr/lib/libbroken.dylib", broken);

    let mut inputs: Vec<InputFile> = paths.iter().map(InputFile::new).collect();
    inputs.push(InputFile::with_state(
        "/usr/lib/libbroken.dylib",
        InclusionState::MustBeIncluded,
    ));

    let mut builder = CacheBuilder::new(options());
    builder.build_from_files(&fs, &mut inputs, &[], &Collaborators::default());

    let message = builder.error_message();
    assert!(message.contains("Required binary was not included"), "{message}");
    assert!(message.contains("/usr/lib/libbroken.dylib"), "{message}");
}

struct MarkerSealer;

impl TextSealer for MarkerSealer {
    fn seal(&self, _text: &[u8], hash_store: &mut [u8]) {
        hash_store.fill(0xAB);
    }
}

#[test]
fn agile_signing_with_fips_seal() {
    let mut dylibs = base_dylib_set();

    let mut corecrypto = minimal_dylib("/usr/lib/system/libcorecrypto.dylib");
    corecrypto.sections = vec![
        ("__TEXT".into(), "__text".into(), 0x000..0x100),
        ("__TEXT".into(), "__fips_hmacs".into(), 0x100..0x120),
    ];
    dylibs.push(loaded(corecrypto, "/usr/lib/system/libcorecrypto.dylib"));

    let mut builder = CacheBuilder::new(CreateOptions {
        code_signing_digest_mode: SigningDigestMode::Agile,
        ..options()
    });
    builder.build(
        dylibs,
        &[],
        &Collaborators {
            fips_sealer: Some(&MarkerSealer),
            ..Collaborators::default()
        },
    );
    assert_eq!(builder.error_message(), "");
    assert!(builder.agile_signature());

    let first = builder.cd_hash_first();
    let second = builder.cd_hash_second();
    assert_eq!(first.len(), 40);
    assert_eq!(second.len(), 40);
    assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(second.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_ne!(first, second);

    // The seal landed in the copied __TEXT of corecrypto.
    let buffer = builder.write_buffer();
    let header = CacheHeader::read_from(&buffer).unwrap();
    let mappings = header.mappings(&buffer).unwrap();
    let images = header.images(&buffer).unwrap();
    let corecrypto_image = images
        .iter()
        .find(|img| {
            read_cstr(&buffer, img.path_file_offset as usize)
                == "/usr/lib/system/libcorecrypto.dylib"
        })
        .expect("corecrypto admitted");
    let text_file_offset = corecrypto_image.address - mappings[0].address;
    let store = &buffer[(text_file_offset + 0x100) as usize..(text_file_offset + 0x120) as usize];
    assert_eq!(store, [0xABu8; 32]);
}

#[test]
fn identical_inputs_produce_identical_uuids() {
    let build = |tweak: u8| {
        let mut dylibs = base_dylib_set();
        // perturb one text byte in one dylib
        let mut image = minimal_dylib("/usr/lib/libz99.dylib");
        image.bytes[0x10] = tweak;
        dylibs.push(loaded(image, "/usr/lib/libz99.dylib"));

        let mut builder = CacheBuilder::new(options());
        builder.build(dylibs, &[], &Collaborators::default());
        assert_eq!(builder.error_message(), "");
        (builder.uuid(), builder.write_buffer())
    };

    let (uuid_a, buffer_a) = build(1);
    let (uuid_b, buffer_b) = build(1);
    let (uuid_c, _) = build(2);

    assert_eq!(uuid_a, uuid_b);
    assert_eq!(buffer_a, buffer_b);
    assert_ne!(uuid_a, uuid_c);

    // RFC-4122 hash-derived UUID tag bits
    assert_eq!(uuid_a[6] >> 4, 3);
    assert_eq!(uuid_a[8] & 0xC0, 0x80);
}

#[test]
fn write_file_is_atomic_and_world_readable() {
    let mut builder = CacheBuilder::new(options());
    builder.build(base_dylib_set(), &[], &Collaborators::default());
    assert_eq!(builder.error_message(), "");
    let expected = builder.write_buffer();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dyld_shared_cache_arm64");
    builder.write_file(&path);
    assert_eq!(builder.error_message(), "");

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written, expected);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}

#[test]
fn map_file_lists_every_dylib_and_segment() {
    let mut builder = CacheBuilder::new(options());
    builder.build(base_dylib_set(), &[], &Collaborators::default());
    let map = builder.map_file();
    assert!(map.contains("/usr/lib/liba00.dylib\n"));
    assert!(map.contains("\t__TEXT 0x"));
    assert!(map.contains("\t__LINKEDIT 0x"));
}

#[test]
fn unplaceable_dylib_is_demoted_with_a_warning() {
    let paths: Vec<String> = (0..30)
        .map(|i| format!("/usr/lib/liba{i:02}.dylib"))
        .collect();
    let mut fs = FakeFileSystem::with_minimal_dylibs(&paths);

    let mut odd = minimal_dylib("/usr/lib/libodd.dylib");
    odd.unplaceable_reason = Some("resides in an unzippered twin".into());
    fs.insert("/usr/lib/libodd.dylib", odd);

    let mut inputs: Vec<InputFile> = paths.iter().map(InputFile::new).collect();
    inputs.push(InputFile::new("/usr/lib/libodd.dylib"));

    let mut builder = CacheBuilder::new(options());
    builder.build_from_files(&fs, &mut inputs, &[], &Collaborators::default());
    assert_eq!(builder.error_message(), "");
    assert!(builder.warnings().iter().any(|w| {
        w.contains("cannot be placed in cache because: resides in an unzippered twin")
    }));
}

#[test]
fn bundles_and_executables_are_not_cached() {
    let paths: Vec<String> = (0..30)
        .map(|i| format!("/usr/lib/liba{i:02}.dylib"))
        .collect();
    let mut fs = FakeFileSystem::with_minimal_dylibs(&paths);

    let mut bundle = minimal_dylib("/Library/Bundles/thing.bundle");
    bundle.kind = MachFileKind::Bundle;
    fs.insert("/Library/Bundles/thing.bundle", bundle);

    let mut exe = minimal_dylib("/bin/tool");
    exe.kind = MachFileKind::DynamicExecutable;
    exe.install_name = None;
    fs.insert("/bin/tool", exe);

    let mut inputs: Vec<InputFile> = paths.iter().map(InputFile::new).collect();
    inputs.push(InputFile::new("/Library/Bundles/thing.bundle"));
    inputs.push(InputFile::new("/bin/tool"));

    let mut builder = CacheBuilder::new(options());
    builder.build_from_files(&fs, &mut inputs, &[], &Collaborators::default());
    assert_eq!(builder.error_message(), "");

    let buffer = builder.write_buffer();
    let header = CacheHeader::read_from(&buffer).unwrap();
    assert_eq!(header.images_count, 30);
}
