//! CSO input: an inline index after the header, records as LZ4 frame block
//! sections.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::formats::cso;
use crate::layout::SECTOR_SIZE;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Byte offset of the record within the logical stream.
    value: u32,
    compressed: bool,
}

pub struct CsoSource {
    files: Vec<File>,
    part_1_size: u64,
    index: Vec<IndexEntry>,
    total_sectors: u32,
}

impl CsoSource {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            files.push(File::open(path).map_err(|source| Error::FileOpen {
                path: path.to_path_buf(),
                source,
            })?);
        }
        if files.is_empty() {
            return Err(Error::Other("no input paths".into()));
        }
        let part_1_size = files[0].metadata()?.len();
        let index = read_index(&mut files[0])?;
        let total_sectors = index.len() as u32 - 1;
        Ok(Self {
            files,
            part_1_size,
            index,
            total_sectors,
        })
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, SECTOR_SIZE);
        let entry = self.index[sector as usize];
        let record_size = (self.index[sector as usize + 1].value - entry.value) as u64;

        let logical = entry.value as u64;
        let (part, in_part) = if logical >= self.part_1_size && self.files.len() > 1 {
            (1, logical - self.part_1_size)
        } else {
            (0, logical)
        };
        let file = &mut self.files[part];
        file.seek(SeekFrom::Start(in_part))?;

        if entry.compressed || record_size < SECTOR_SIZE {
            let mut record = vec![0u8; record_size as usize];
            file.read_exact(&mut record)?;
            decode_frame_block(sector, &record, buf)
        } else if record_size != SECTOR_SIZE {
            Err(Error::InvalidImage(format!(
                "sector {sector}: stored record of {record_size} bytes"
            )))
        } else {
            file.read_exact(buf)?;
            Ok(())
        }
    }
}

/// Decodes one LZ4 frame block section (length word plus block data), the
/// form the record takes once the fixed frame header and end mark are
/// stripped.
fn decode_frame_block(sector: u32, record: &[u8], out: &mut [u8]) -> Result<()> {
    if record.len() < 4 {
        return Err(Error::InvalidImage(format!("sector {sector}: short record")));
    }
    let word = u32::from_le_bytes(record[0..4].try_into().unwrap());
    let block_len = (word & !cso::FRAME_BLOCK_UNCOMPRESSED) as usize;
    let block = record
        .get(4..4 + block_len)
        .ok_or_else(|| Error::InvalidImage(format!("sector {sector}: truncated record")))?;

    if word & cso::FRAME_BLOCK_UNCOMPRESSED != 0 {
        if block.len() as u64 != SECTOR_SIZE {
            return Err(Error::InvalidImage(format!(
                "sector {sector}: stored frame block of {} bytes",
                block.len()
            )));
        }
        out.copy_from_slice(block);
        return Ok(());
    }

    let size = lz4_flex::block::decompress_into(block, out)
        .map_err(|e| Error::InvalidImage(format!("lz4 frame block: {e}")))?;
    if size as u64 != SECTOR_SIZE {
        return Err(Error::InvalidImage(format!(
            "sector {sector} decompressed to {size} bytes"
        )));
    }
    Ok(())
}

fn read_index(file: &mut File) -> Result<Vec<IndexEntry>> {
    let mut header_bytes = [0u8; cso::HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_bytes)?;
    let header: cso::Header = bytemuck::pod_read_unaligned(&header_bytes);
    if !header.validate() {
        return Err(Error::InvalidImage("bad CSO header".into()));
    }

    let sectors = (header.uncompressed_size.get() / SECTOR_SIZE) as usize;
    let mut raw = vec![0u8; (sectors + 1) * 4];
    file.read_exact(&mut raw)?;
    let mut index = Vec::with_capacity(sectors + 1);
    for word in raw.chunks_exact(4) {
        let value = u32::from_le_bytes(word.try_into().unwrap());
        index.push(IndexEntry {
            value: (value & !cso::INDEX_COMPRESSED) << cso::INDEX_ALIGNMENT,
            compressed: value & cso::INDEX_COMPRESSED != 0,
        });
    }
    Ok(index)
}
