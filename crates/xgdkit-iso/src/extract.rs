//! Extraction of an image's files onto the host filesystem.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::exe::{patch_xbe_file, MediaPatch};
use crate::layout::SECTOR_SIZE;
use crate::read::ImageReader;
use crate::{create_dir_all, Error, Result};

/// Copy chunk for file data, in bytes.
const COPY_CHUNK: u64 = 64 * 1024;

pub struct Extractor<'r> {
    reader: &'r mut ImageReader,
    media_patch: Option<MediaPatch>,
}

impl<'r> Extractor<'r> {
    pub fn new(reader: &'r mut ImageReader) -> Self {
        Self {
            reader,
            media_patch: None,
        }
    }

    /// Also patch the allowed-media field of any extracted `default.xbe`.
    pub fn with_media_patch(mut self, patch: MediaPatch) -> Self {
        self.media_patch = Some(patch);
        self
    }

    pub fn extract(self, out_directory: &Path, token: &CancelToken) -> Result<()> {
        create_dir_all(out_directory)?;
        let image_offset = self.reader.image_offset();
        let entries = self.reader.directory_entries()?.to_vec();
        let total: u64 = entries
            .iter()
            .filter(|e| !e.header.is_directory())
            .map(|e| e.header.file_size.get() as u64)
            .sum();
        tracing::info!(files = entries.len(), bytes = total, "extracting");

        let mut buffer = vec![0u8; COPY_CHUNK as usize];
        for entry in &entries {
            token.checkpoint()?;
            let target = safe_join(out_directory, &entry.path)?;

            if entry.header.is_directory() {
                create_dir_all(&target)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                create_dir_all(parent)?;
            }
            let mut out_file = File::create(&target).map_err(|source| Error::FileOpen {
                path: target.clone(),
                source,
            })?;

            let mut remaining = entry.header.file_size.get() as u64;
            let mut position =
                image_offset + entry.header.start_sector.get() as u64 * SECTOR_SIZE;
            while remaining > 0 {
                token.checkpoint()?;
                let read_size = remaining.min(COPY_CHUNK);
                self.reader
                    .read_bytes(position, &mut buffer[..read_size as usize])?;
                out_file.write_all(&buffer[..read_size as usize])?;
                remaining -= read_size;
                position += read_size;
            }
            out_file.flush()?;

            if let Some(patch) = self.media_patch {
                if entry.filename.eq_ignore_ascii_case("default.xbe") {
                    patch_xbe_file(&target, patch)?;
                }
            }
        }
        Ok(())
    }
}

/// Resolves an on-disc path under the output root, refusing components that
/// could escape it or collide with device names.
fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            std::path::Component::Normal(part) => {
                let name = part.to_string_lossy();
                if !xgdkit_common::str::is_safe_name(&name) {
                    return Err(Error::Encoding(format!(
                        "unsafe name in image: {}",
                        relative.display()
                    )));
                }
                out.push(part);
            }
            _ => {
                return Err(Error::Encoding(format!(
                    "unsafe path in image: {}",
                    relative.display()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_traversal() {
        let root = Path::new("/tmp/out");
        assert!(safe_join(root, Path::new("a/b.bin")).is_ok());
        assert!(safe_join(root, Path::new("../evil")).is_err());
        assert!(safe_join(root, Path::new("a/../../evil")).is_err());
        assert!(safe_join(root, Path::new("CON")).is_err());
    }
}
