//! GoD input: a set of Data parts whose hash blocks are hidden from the
//! caller, leaving the plain XISO sector stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::formats::god;
use crate::layout::SECTOR_SIZE;
use crate::{Error, Result};

pub struct GodSource {
    files: Vec<File>,
    total_sectors: u32,
}

impl GodSource {
    /// Opens the `Data*` parts found under `directory` (searched up to five
    /// levels deep), in lexical order.
    pub fn open(directory: &Path) -> Result<Self> {
        let mut data_paths = Vec::new();
        find_data_files(directory, 5, &mut data_paths)?;
        if data_paths.is_empty() {
            return Err(Error::InvalidImage(format!(
                "no Data files under {}",
                directory.display()
            )));
        }
        data_paths.sort();

        let last_size = std::fs::metadata(data_paths.last().unwrap())?.len();
        let last_blocks = last_size / god::BLOCK_SIZE;
        // blocks = 1 master + sub-hashtables + data; each sub-hashtable
        // fronts up to 204 data blocks.
        let last_shts = (last_blocks.saturating_sub(1)).div_ceil(god::DATA_BLOCKS_PER_SHT as u64 + 1);
        let last_data_blocks = last_blocks.saturating_sub(1 + last_shts);
        let total_data_blocks =
            (data_paths.len() as u64 - 1) * god::DATA_BLOCKS_PER_PART as u64 + last_data_blocks;
        let total_sectors = (total_data_blocks * (god::BLOCK_SIZE / SECTOR_SIZE)) as u32;

        let mut files = Vec::with_capacity(data_paths.len());
        for path in &data_paths {
            files.push(File::open(path).map_err(|source| Error::FileOpen {
                path: path.clone(),
                source,
            })?);
        }
        tracing::debug!(parts = files.len(), total_sectors, "opened GoD data files");
        Ok(Self {
            files,
            total_sectors,
        })
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, SECTOR_SIZE);
        let remap = god::remap_sector(sector as u64);
        let file = self
            .files
            .get_mut(remap.part as usize)
            .ok_or_else(|| Error::InvalidImage(format!("sector {sector} is out of bounds")))?;
        file.seek(SeekFrom::Start(remap.offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

fn find_data_files(directory: &Path, depth: i32, out: &mut Vec<PathBuf>) -> Result<()> {
    if depth < 0 {
        return Ok(());
    }
    for entry in std::fs::read_dir(directory).map_err(|source| Error::FileOpen {
        path: directory.to_path_buf(),
        source,
    })? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.contains("data") {
                out.push(path);
            }
        } else if file_type.is_dir() {
            find_data_files(&path, depth - 1, out)?;
        }
    }
    Ok(())
}
