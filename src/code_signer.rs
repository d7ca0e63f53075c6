//! Ad-hoc code signature over the finished cache.
//!
//! One SuperBlob holds the code directory (two in Agile mode), an empty
//! requirements set, and an empty CMS wrapper. Every 4 KiB page of the
//! mapped regions plus the local-symbols region is hashed; the cache UUID
//! is then derived from the code directory and page 0 is re-hashed so the
//! signature covers the final UUID.

use rayon::prelude::*;
use scroll::{BE, Pwrite};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::arch::align;
use crate::cache_format::{
    CS_BLOB_INDEX_SIZE, CS_BLOB_SIZE, CS_CD_CODE_LIMIT, CS_CD_EXEC_SEG_BASE, CS_CD_EXEC_SEG_LIMIT,
    CS_CD_FLAGS, CS_CD_HASH_OFFSET, CS_CD_HASH_SIZE, CS_CD_HASH_TYPE, CS_CD_IDENT_OFFSET,
    CS_CD_LENGTH, CS_CD_MAGIC, CS_CD_N_CODE_SLOTS, CS_CD_N_SPECIAL_SLOTS, CS_CD_PAGE_SIZE,
    CS_CD_SIZE, CS_CD_VERSION, CS_CODEDIRECTORY_VERSION, CS_HASH_SIZE_SHA1, CS_HASH_SIZE_SHA256,
    CS_HASHTYPE_SHA1, CS_HASHTYPE_SHA256, CS_REQUIREMENTS_SIZE, CS_SIGNATURE_ADHOC,
    CS_SUPERBLOB_SIZE, CSMAGIC_BLOBWRAPPER, CSMAGIC_CODEDIRECTORY, CSMAGIC_EMBEDDED_SIGNATURE,
    CSMAGIC_REQUIREMENTS, CSSLOT_ALTERNATE_CODEDIRECTORIES, CSSLOT_CMS_SIGNATURE,
    CSSLOT_CODEDIRECTORY, CSSLOT_REQUIREMENTS, PAGE_SIZE,
};
use crate::diagnostics::Diagnostics;
use crate::errors::BuildError;

/// Which digests the signature carries. Agile pairs a SHA-1 primary code
/// directory with a SHA-256 alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningDigestMode {
    Sha1Only,
    Sha256Only,
    Agile,
}

#[derive(Debug, Clone, Copy)]
enum HashAlg {
    Sha1,
    Sha256,
}

impl HashAlg {
    fn size(self) -> usize {
        match self {
            HashAlg::Sha1 => CS_HASH_SIZE_SHA1,
            HashAlg::Sha256 => CS_HASH_SIZE_SHA256,
        }
    }

    fn digest_into(self, data: &[u8], out: &mut [u8]) {
        match self {
            HashAlg::Sha1 => out.copy_from_slice(&Sha1::digest(data)),
            HashAlg::Sha256 => out.copy_from_slice(&Sha256::digest(data)),
        }
    }
}

/// Pre-computed blob layout; the builder records the signature's file
/// offset and size in the header before any page is hashed.
pub(crate) struct SignatureLayout {
    agile: bool,
    primary: HashAlg,
    identifier: String,
    /// Number of 4 KiB code slots over the signed regions.
    slot_count: usize,
    hash_offset: usize,
    hash256_offset: usize,
    cd_offset: usize,
    cd_size: usize,
    cd256_offset: usize,
    cd256_size: usize,
    reqs_offset: usize,
    cms_offset: usize,
    sb_size: usize,
    signed_size: u64,
    pub sig_size: u64,
}

pub(crate) struct CodeSignature {
    pub buffer: Vec<u8>,
    pub cd_hash_first: [u8; 20],
    pub cd_hash_second: [u8; 20],
}

impl SignatureLayout {
    pub(crate) fn compute(
        mode: SigningDigestMode,
        arch_name: &str,
        dylibs_removed_during_mastering: bool,
        optimize_stubs: bool,
        signed_size: u64,
    ) -> SignatureLayout {
        let (agile, primary) = match mode {
            // The main code directory stays SHA-1 for compatibility.
            SigningDigestMode::Agile => (true, HashAlg::Sha1),
            SigningDigestMode::Sha1Only => (false, HashAlg::Sha1),
            SigningDigestMode::Sha256Only => (false, HashAlg::Sha256),
        };

        let mut identifier = format!("com.apple.dyld.cache.{arch_name}");
        if dylibs_removed_during_mastering {
            identifier.push_str(if optimize_stubs { ".release" } else { ".development" });
        }

        let blob_count = if agile { 4 } else { 3 };
        let id_size = identifier.len() + 1;
        let slot_count = signed_size.div_ceil(PAGE_SIZE) as usize;
        let special_slots = CSSLOT_REQUIREMENTS as usize;

        let hash_offset = CS_CD_SIZE + id_size + primary.size() * special_slots;
        let hash256_offset = CS_CD_SIZE + id_size + CS_HASH_SIZE_SHA256 * special_slots;
        let cd_size = hash_offset + slot_count * primary.size();
        let cd256_size = if agile {
            hash256_offset + slot_count * CS_HASH_SIZE_SHA256
        } else {
            0
        };

        let cd_offset = CS_SUPERBLOB_SIZE + blob_count * CS_BLOB_INDEX_SIZE;
        let cd256_offset = cd_offset + cd_size;
        let reqs_offset = cd256_offset + cd256_size;
        let cms_offset = reqs_offset + CS_REQUIREMENTS_SIZE;
        let sb_size = cms_offset + CS_BLOB_SIZE;
        // keep the whole cache file 16KB aligned
        let sig_size = align(sb_size as u64, 14);

        SignatureLayout {
            agile,
            primary,
            identifier,
            slot_count,
            hash_offset,
            hash256_offset,
            cd_offset,
            cd_size,
            cd256_offset,
            cd256_size,
            reqs_offset,
            cms_offset,
            sb_size,
            signed_size,
            sig_size,
        }
    }

    /// Hash every page and assemble the blob. `regions` are the mapped
    /// regions in file order; the derived UUID is written into the header
    /// (page 0 of `rx`) and covered by a final re-hash of page 0.
    pub(crate) fn sign(
        &self,
        mut regions: RegionsToSign<'_>,
        exec_seg_base: u64,
        exec_seg_limit: u64,
        diag: &mut Diagnostics,
    ) -> Option<CodeSignature> {
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(self.sig_size as usize).is_err() {
            diag.error(BuildError::AllocationFailure);
            return None;
        }
        buffer.resize(self.sig_size as usize, 0);

        self.write_blobs(&mut buffer, exec_seg_base, exec_seg_limit);

        // Per-page code hashes, each slot over a disjoint input range.
        self.hash_pages(&mut buffer, &regions, self.primary, self.cd_offset, self.hash_offset);
        if self.agile {
            self.hash_pages(
                &mut buffer,
                &regions,
                HashAlg::Sha256,
                self.cd256_offset,
                self.hash256_offset,
            );
        }

        // Derive the UUID from the code directory, write it into the
        // header, then re-hash page 0 so the signature covers it.
        let cd_bytes = &buffer[self.cd_offset..self.cd_offset + self.cd_size];
        let mut uuid = md5::compute(cd_bytes).0;
        // tag as a RFC-4122 hash-derived (version 3) UUID
        uuid[6] = (uuid[6] & 0x0F) | (3 << 4);
        uuid[8] = (uuid[8] & 0x3F) | 0x80;
        let uuid_offset = regions.uuid_offset;
        regions.rx[uuid_offset..uuid_offset + 16].copy_from_slice(&uuid);

        let page0 = regions.page(0, self.slot_count).to_vec();
        self.primary.digest_into(
            &page0,
            &mut buffer[self.cd_offset + self.hash_offset
                ..self.cd_offset + self.hash_offset + self.primary.size()],
        );
        if self.agile {
            HashAlg::Sha256.digest_into(
                &page0,
                &mut buffer[self.cd256_offset + self.hash256_offset
                    ..self.cd256_offset + self.hash256_offset + CS_HASH_SIZE_SHA256],
            );
        }

        // cdHash is the first 20 bytes of the code directory digest, even
        // for SHA-256.
        let mut cd_hash_first = [0u8; 20];
        let mut full = vec![0u8; self.primary.size()];
        self.primary
            .digest_into(&buffer[self.cd_offset..self.cd_offset + self.cd_size], &mut full);
        cd_hash_first.copy_from_slice(&full[..20]);

        let mut cd_hash_second = [0u8; 20];
        if self.agile {
            let digest =
                Sha256::digest(&buffer[self.cd256_offset..self.cd256_offset + self.cd256_size]);
            cd_hash_second.copy_from_slice(&digest[..20]);
        }

        Some(CodeSignature {
            buffer,
            cd_hash_first,
            cd_hash_second,
        })
    }

    /// SuperBlob index, code directories, empty requirements and CMS
    /// wrapper.
    fn write_blobs(&self, buffer: &mut [u8], exec_seg_base: u64, exec_seg_limit: u64) {
        let put = |buffer: &mut [u8], offset: usize, value: u32| {
            buffer
                .pwrite_with::<u32>(value, offset, BE)
                .expect("blob field within signature buffer");
        };

        let blob_count = if self.agile { 4u32 } else { 3 };
        put(buffer, 0, CSMAGIC_EMBEDDED_SIGNATURE);
        put(buffer, 4, self.sb_size as u32);
        put(buffer, 8, blob_count);

        let mut off = CS_SUPERBLOB_SIZE;
        let mut index = |buffer: &mut [u8], slot: u32, blob_offset: usize| {
            put(buffer, off, slot);
            put(buffer, off + 4, blob_offset as u32);
            off += CS_BLOB_INDEX_SIZE;
        };
        index(buffer, CSSLOT_CODEDIRECTORY, self.cd_offset);
        index(buffer, CSSLOT_REQUIREMENTS, self.reqs_offset);
        index(buffer, CSSLOT_CMS_SIGNATURE, self.cms_offset);
        if self.agile {
            index(buffer, CSSLOT_ALTERNATE_CODEDIRECTORIES, self.cd256_offset);
        }

        self.write_code_directory(
            buffer,
            self.cd_offset,
            self.cd_size,
            self.primary,
            self.hash_offset,
            exec_seg_base,
            exec_seg_limit,
        );
        if self.agile {
            self.write_code_directory(
                buffer,
                self.cd256_offset,
                self.cd256_size,
                HashAlg::Sha256,
                self.hash256_offset,
                exec_seg_base,
                exec_seg_limit,
            );
        }

        // empty requirement set
        put(buffer, self.reqs_offset, CSMAGIC_REQUIREMENTS);
        put(buffer, self.reqs_offset + 4, CS_REQUIREMENTS_SIZE as u32);
        put(buffer, self.reqs_offset + 8, 0);

        // empty CMS wrapper for ad-hoc signing
        put(buffer, self.cms_offset, CSMAGIC_BLOBWRAPPER);
        put(buffer, self.cms_offset + 4, CS_BLOB_SIZE as u32);

        // special slot hashes: only requirements is non-empty
        let mut reqs_blob = [0u8; CS_REQUIREMENTS_SIZE];
        put(&mut reqs_blob, 0, CSMAGIC_REQUIREMENTS);
        put(&mut reqs_blob, 4, CS_REQUIREMENTS_SIZE as u32);
        let slot =
            self.cd_offset + self.hash_offset - CSSLOT_REQUIREMENTS as usize * self.primary.size();
        self.primary
            .digest_into(&reqs_blob, &mut buffer[slot..slot + self.primary.size()]);
        if self.agile {
            let slot = self.cd256_offset + self.hash256_offset
                - CSSLOT_REQUIREMENTS as usize * CS_HASH_SIZE_SHA256;
            HashAlg::Sha256.digest_into(&reqs_blob, &mut buffer[slot..slot + CS_HASH_SIZE_SHA256]);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_code_directory(
        &self,
        buffer: &mut [u8],
        cd_offset: usize,
        cd_size: usize,
        alg: HashAlg,
        hash_offset: usize,
        exec_seg_base: u64,
        exec_seg_limit: u64,
    ) {
        let hash_type = match alg {
            HashAlg::Sha1 => CS_HASHTYPE_SHA1,
            HashAlg::Sha256 => CS_HASHTYPE_SHA256,
        };
        let cd = &mut buffer[cd_offset..cd_offset + cd_size];
        let put = |cd: &mut [u8], offset: usize, value: u32| {
            cd.pwrite_with::<u32>(value, offset, BE)
                .expect("field within code directory");
        };
        put(cd, CS_CD_MAGIC, CSMAGIC_CODEDIRECTORY);
        put(cd, CS_CD_LENGTH, cd_size as u32);
        put(cd, CS_CD_VERSION, CS_CODEDIRECTORY_VERSION);
        put(cd, CS_CD_FLAGS, CS_SIGNATURE_ADHOC);
        put(cd, CS_CD_HASH_OFFSET, hash_offset as u32);
        put(cd, CS_CD_IDENT_OFFSET, CS_CD_SIZE as u32);
        put(cd, CS_CD_N_SPECIAL_SLOTS, CSSLOT_REQUIREMENTS);
        put(cd, CS_CD_N_CODE_SLOTS, self.slot_count as u32);
        // codeLimit64 stays zero; the 32-bit field is authoritative
        put(cd, CS_CD_CODE_LIMIT, self.signed_size as u32);
        cd[CS_CD_HASH_SIZE] = alg.size() as u8;
        cd[CS_CD_HASH_TYPE] = hash_type;
        cd[CS_CD_PAGE_SIZE] = PAGE_SIZE.trailing_zeros() as u8;
        cd.pwrite_with::<u64>(exec_seg_base, CS_CD_EXEC_SEG_BASE, BE)
            .expect("field within code directory");
        cd.pwrite_with::<u64>(exec_seg_limit, CS_CD_EXEC_SEG_LIMIT, BE)
            .expect("field within code directory");

        let id = self.identifier.as_bytes();
        cd[CS_CD_SIZE..CS_CD_SIZE + id.len()].copy_from_slice(id);
    }

    fn hash_pages(
        &self,
        buffer: &mut [u8],
        regions: &RegionsToSign<'_>,
        alg: HashAlg,
        cd_offset: usize,
        hash_offset: usize,
    ) {
        let hash_size = alg.size();
        let start = cd_offset + hash_offset;
        let hash_area = &mut buffer[start..start + self.slot_count * hash_size];
        hash_area
            .par_chunks_mut(hash_size)
            .enumerate()
            .for_each(|(slot, out)| {
                alg.digest_into(regions.page(slot, self.slot_count), out);
            });
    }
}

/// The mapped regions in file order, borrowed for hashing; `rx` is mutable
/// only so the derived UUID can land in the header before page 0's
/// re-hash.
pub(crate) struct RegionsToSign<'a> {
    pub rx: &'a mut [u8],
    pub rw: &'a [u8],
    pub ro: &'a [u8],
    pub local_symbols: &'a [u8],
    /// Offset of the header's UUID field within `rx`.
    pub uuid_offset: usize,
}

impl RegionsToSign<'_> {
    /// The 4 KiB page for a code slot. Every region's size is page
    /// aligned, so slots never straddle regions.
    fn page(&self, slot: usize, slot_count: usize) -> &[u8] {
        assert!(slot < slot_count);
        let page = PAGE_SIZE as usize;
        let mut index = slot;
        for region in [&self.rx[..], self.rw, self.ro, self.local_symbols] {
            let pages = region.len() / page;
            if index < pages {
                return &region[index * page..(index + 1) * page];
            }
            index -= pages;
        }
        panic!("code slot {slot} beyond signed regions");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hex(bytes: &[u8; 20]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn sign_fixture(mode: SigningDigestMode, seed: u8) -> (CodeSignature, Vec<u8>) {
        let mut rx = vec![seed; 0x2000];
        let rw = vec![seed.wrapping_add(1); 0x1000];
        let ro = vec![seed.wrapping_add(2); 0x1000];
        let layout = SignatureLayout::compute(mode, "arm64", false, false, 0x4000);
        let mut diag = Diagnostics::default();
        let regions = RegionsToSign {
            rx: &mut rx,
            rw: &rw,
            ro: &ro,
            local_symbols: &[],
            uuid_offset: 0x50,
        };
        let sig = layout
            .sign(regions, 0, 0x2000, &mut diag)
            .expect("signing succeeds");
        (sig, rx)
    }

    #[test]
    fn agile_produces_two_distinct_cd_hashes() {
        let (sig, _) = sign_fixture(SigningDigestMode::Agile, 7);
        assert_eq!(hex(&sig.cd_hash_first).len(), 40);
        assert_eq!(hex(&sig.cd_hash_second).len(), 40);
        assert_ne!(sig.cd_hash_first, sig.cd_hash_second);
    }

    #[test]
    fn sha256_only_leaves_second_hash_empty() {
        let (sig, _) = sign_fixture(SigningDigestMode::Sha256Only, 7);
        assert_ne!(sig.cd_hash_first, [0u8; 20]);
        assert_eq!(sig.cd_hash_second, [0u8; 20]);
    }

    #[test]
    fn signing_is_deterministic_and_tags_the_uuid() {
        let (a, rx_a) = sign_fixture(SigningDigestMode::Sha1Only, 3);
        let (b, rx_b) = sign_fixture(SigningDigestMode::Sha1Only, 3);
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(a.cd_hash_first, b.cd_hash_first);
        assert_eq!(rx_a[0x50..0x60], rx_b[0x50..0x60]);

        // version-3 tag bits
        assert_eq!(rx_a[0x56] >> 4, 3);
        assert_eq!(rx_a[0x58] & 0xC0, 0x80);

        let (c, _) = sign_fixture(SigningDigestMode::Sha1Only, 4);
        assert_ne!(a.cd_hash_first, c.cd_hash_first);
    }

    #[test]
    fn signature_is_16k_aligned() {
        let layout = SignatureLayout::compute(SigningDigestMode::Agile, "x86_64", true, true, 0x10000);
        assert_eq!(layout.sig_size % (1 << 14), 0);
        assert!(layout.identifier.ends_with(".release"));
    }
}
