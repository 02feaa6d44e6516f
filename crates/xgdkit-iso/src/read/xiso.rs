//! Raw XISO input, possibly split across two physical files.

use std::path::Path;

use crate::layout::{IMAGE_OFFSETS, MAGIC_DATA, MAGIC_OFFSET, SECTOR_SIZE};
use crate::split::SplitReader;
use crate::{Error, Result};

pub struct XisoSource {
    file: SplitReader,
    image_offset: u64,
    total_sectors: u32,
}

impl XisoSource {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut file = SplitReader::open(paths)?;
        let total_sectors = (file.len() / SECTOR_SIZE) as u32;
        let image_offset = probe_image_offset(&mut file)?;
        Ok(Self {
            file,
            image_offset,
            total_sectors,
        })
    }

    pub fn image_offset(&self) -> u64 {
        self.image_offset
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, SECTOR_SIZE);
        self.file
            .read_exact_at(sector as u64 * SECTOR_SIZE, buf)
    }

    pub fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(offset, buf)
    }
}

/// Finds where the filesystem begins by probing the known partition offsets
/// for the volume magic.
fn probe_image_offset(file: &mut SplitReader) -> Result<u64> {
    let mut magic = [0u8; 20];
    for offset in IMAGE_OFFSETS {
        if file.read_exact_at(offset + MAGIC_OFFSET, &mut magic).is_err() {
            continue;
        }
        if &magic == MAGIC_DATA {
            tracing::debug!(offset, "found volume magic");
            return Ok(offset);
        }
    }
    Err(Error::InvalidImage(
        "no XISO volume magic at any known offset".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_the_magic_at_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.iso");
        let mut image = vec![0u8; 0x10800];
        image[0x10000..0x10014].copy_from_slice(MAGIC_DATA);
        std::fs::write(&path, &image).unwrap();

        let source = XisoSource::open(&[path]).unwrap();
        assert_eq!(source.image_offset(), 0);
        assert_eq!(source.total_sectors(), 33);
    }

    #[test]
    fn rejects_non_xiso_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.iso");
        std::fs::write(&path, vec![0u8; 0x11000]).unwrap();
        assert!(matches!(
            XisoSource::open(&[path]),
            Err(Error::InvalidImage(_))
        ));
    }
}
