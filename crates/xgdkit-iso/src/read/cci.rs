//! CCI input: one or two parts, each with its own header and index.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::formats::cci;
use crate::layout::SECTOR_SIZE;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Byte offset of the record within its part.
    value: u32,
    compressed: bool,
}

pub struct CciSource {
    files: Vec<File>,
    /// Per part, one entry per sector plus a terminator.
    indexes: Vec<Vec<IndexEntry>>,
    total_sectors: u32,
}

impl CciSource {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        let mut indexes = Vec::with_capacity(paths.len());
        let mut total_sectors = 0u32;

        for path in paths {
            let path = path.as_ref();
            let mut file = File::open(path).map_err(|source| Error::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
            let index = read_part_index(&mut file)?;
            total_sectors += index.len() as u32 - 1;
            files.push(file);
            indexes.push(index);
        }
        if files.is_empty() {
            return Err(Error::Other("no input paths".into()));
        }
        Ok(Self {
            files,
            indexes,
            total_sectors,
        })
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, SECTOR_SIZE);
        // The terminator entry carries no sector; anything past it lives in
        // the second part.
        let part_1_sectors = self.indexes[0].len() as u32 - 1;
        let part = usize::from(sector >= part_1_sectors);
        if part == 1 && self.files.len() < 2 {
            return Err(Error::InvalidImage(format!(
                "sector {sector} is out of bounds"
            )));
        }
        let sector_in_part = (sector - part as u32 * part_1_sectors) as usize;
        let index = &self.indexes[part];
        let entry = index[sector_in_part];
        let record_size = (index[sector_in_part + 1].value - entry.value) as u64;
        let file = &mut self.files[part];

        if entry.compressed || record_size < SECTOR_SIZE {
            file.seek(SeekFrom::Start(entry.value as u64))?;
            let mut padding = [0u8; 1];
            file.read_exact(&mut padding)?;
            let compressed_size = record_size as usize - 1 - padding[0] as usize;
            let mut compressed = vec![0u8; compressed_size];
            file.read_exact(&mut compressed)?;
            let size = lz4_flex::block::decompress_into(&compressed, buf)
                .map_err(|e| Error::InvalidImage(format!("lz4 block: {e}")))?;
            if size as u64 != SECTOR_SIZE {
                return Err(Error::InvalidImage(format!(
                    "sector {sector} decompressed to {size} bytes"
                )));
            }
        } else {
            file.seek(SeekFrom::Start(entry.value as u64))?;
            file.read_exact(buf)?;
        }
        Ok(())
    }
}

fn read_part_index(file: &mut File) -> Result<Vec<IndexEntry>> {
    let mut header_bytes = [0u8; cci::HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_bytes)?;
    let header: cci::Header = bytemuck::pod_read_unaligned(&header_bytes);
    if !header.validate() {
        return Err(Error::InvalidImage("bad CCI header".into()));
    }

    let sectors = (header.uncompressed_size.get() / SECTOR_SIZE) as usize;
    let mut index = Vec::with_capacity(sectors + 1);
    file.seek(SeekFrom::Start(header.index_offset.get()))?;
    let mut raw = vec![0u8; (sectors + 1) * 4];
    file.read_exact(&mut raw)?;
    for word in raw.chunks_exact(4) {
        let value = u32::from_le_bytes(word.try_into().unwrap());
        index.push(IndexEntry {
            value: (value & !cci::INDEX_COMPRESSED) << cci::INDEX_ALIGNMENT,
            compressed: value & cci::INDEX_COMPRESSED != 0,
        });
    }
    Ok(index)
}
