//! Emitting the finished cache: to a file (atomically, via a temp file) or
//! to one contiguous buffer, plus the human-readable map file.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::cache_builder::{CacheBuilder, Region};
use crate::cache_format::{CacheHeader, read_struct};
use crate::errors::BuildError;

impl CacheBuilder {
    fn region_bytes(&self, region: &Region) -> &[u8] {
        let start = region.arena_offset as usize;
        &self.arena[start..start + region.size_in_use as usize]
    }

    /// The file's contents as `(offset, bytes)` runs, in file order, plus
    /// the total size. The last run is always the code signature, at the
    /// sum of all preceding regions' in-use sizes.
    fn cache_parts(&self) -> (u64, Vec<(u64, &[u8])>) {
        let header: CacheHeader = read_struct(&self.arena, 0).expect("cache header written");
        let mappings = header.mappings(&self.arena).expect("mappings written");
        let signature = self.code_signature.as_ref().expect("cache signed");

        assert_eq!(self.read_execute_region.size_in_use, mappings[0].size);
        assert_eq!(self.read_write_region.size_in_use, mappings[1].size);
        assert_eq!(self.read_only_region.size_in_use, mappings[2].size);
        assert_eq!(self.read_execute_region.cache_file_offset, mappings[0].file_offset);
        assert_eq!(self.read_write_region.cache_file_offset, mappings[1].file_offset);
        assert_eq!(self.read_only_region.cache_file_offset, mappings[2].file_offset);
        assert_eq!(header.code_signature_size, signature.buffer.len() as u64);
        assert_eq!(
            header.code_signature_offset,
            mappings[2].file_offset
                + self.read_only_region.size_in_use
                + self.local_symbols_region.size_in_use
        );

        let mut parts = vec![
            (mappings[0].file_offset, self.region_bytes(&self.read_execute_region)),
            (mappings[1].file_offset, self.region_bytes(&self.read_write_region)),
            (mappings[2].file_offset, self.region_bytes(&self.read_only_region)),
        ];
        if self.local_symbols_region.size_in_use != 0 {
            assert_eq!(
                header.local_symbols_offset,
                mappings[2].file_offset + self.read_only_region.size_in_use
            );
            parts.push((
                header.local_symbols_offset,
                self.region_bytes(&self.local_symbols_region),
            ));
        }
        parts.push((header.code_signature_offset, &signature.buffer));

        let total = header.code_signature_offset + signature.buffer.len() as u64;
        (total, parts)
    }

    /// Write the cache into a fresh temp file beside `path`, then rename
    /// it into place. A failure unlinks the temp file and is recorded in
    /// the diagnostics.
    pub fn write_file(&mut self, path: impl AsRef<Path>) {
        if self.diagnostics_have_error() || self.code_signature.is_none() {
            return;
        }
        let path = path.as_ref();
        let result = self.write_file_inner(path);
        if let Err(source) = result {
            self.record_error(BuildError::WriteFailed {
                path: path.display().to_string(),
                source,
            });
        }
    }

    fn write_file_inner(&self, path: &Path) -> std::io::Result<()> {
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut temp = match directory {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };

        let (total, parts) = self.cache_parts();
        temp.as_file().set_len(total)?;
        for (offset, bytes) in parts {
            temp.as_file_mut().seek(SeekFrom::Start(offset))?;
            temp.as_file_mut().write_all(bytes)?;
        }
        temp.as_file_mut().flush()?;

        // temp files are created "rw-------"; the published cache must be
        // world readable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }

        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// The whole cache file in one contiguous buffer.
    pub fn write_buffer(&self) -> Vec<u8> {
        let (total, parts) = self.cache_parts();
        let mut buffer = vec![0u8; total as usize];
        for (offset, bytes) in parts {
            buffer[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        }
        buffer
    }

    /// Human-readable map of where every segment landed.
    pub fn map_file(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        for dylib in &self.sorted_dylibs {
            let _ = writeln!(out, "{}", dylib.image.runtime_path);
            for loc in &dylib.cache_location {
                let _ = writeln!(
                    out,
                    "\t{} 0x{:X} -> 0x{:X}",
                    loc.seg_name,
                    loc.dst_unslid_address,
                    loc.dst_unslid_address + loc.dst_segment_size
                );
            }
        }
        out
    }

    pub fn write_map_file(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if let Err(source) = std::fs::write(path, self.map_file()) {
            self.record_error(BuildError::WriteFailed {
                path: path.display().to_string(),
                source,
            });
        }
    }
}
