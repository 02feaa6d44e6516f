//! Uniform sector access over every supported container.
//!
//! [`ImageReader`] hides the container behind `read_sector`/`read_bytes` and
//! caches the products of walking the on-disc tree: the flat entry list, the
//! set of sectors that actually hold data, the boot executable, and the
//! volume timestamp.

mod cci;
mod cso;
mod god;
mod walker;
mod xiso;

pub use cci::CciSource;
pub use cso::CsoSource;
pub use god::GodSource;
pub use xiso::XisoSource;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use xgdkit_common::time::FileTime;

use crate::layout::{DirentHeader, MAGIC_OFFSET, SECTOR_SIZE};
use crate::{Error, Platform, Result};

/// One entry of the on-disc tree, flattened.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub header: DirentHeader,
    pub filename: String,
    /// Raw name bytes as stored on disc (Windows-1252).
    pub name_bytes: Vec<u8>,
    /// Byte position of the containing directory table, relative to the
    /// image offset.
    pub position: u64,
    /// Offset of this entry within its table, in 32-bit words.
    pub offset: u64,
    /// Path relative to the image root.
    pub path: PathBuf,
}

enum Source {
    Xiso(XisoSource),
    Cci(CciSource),
    Cso(CsoSource),
    God(GodSource),
}

impl Source {
    fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        match self {
            Source::Xiso(s) => s.read_sector(sector, buf),
            Source::Cci(s) => s.read_sector(sector, buf),
            Source::Cso(s) => s.read_sector(sector, buf),
            Source::God(s) => s.read_sector(sector, buf),
        }
    }

    /// Reads an arbitrary span by assembling the sectors that cover it.
    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Source::Xiso(s) = self {
            // The raw stream can be addressed directly.
            return s.read_bytes(offset, buf);
        }
        let in_sector = offset % SECTOR_SIZE;
        let start_sector = offset / SECTOR_SIZE;
        let covering = (in_sector + buf.len() as u64).div_ceil(SECTOR_SIZE);
        let mut assembled = vec![0u8; (covering * SECTOR_SIZE) as usize];
        for i in 0..covering {
            let chunk =
                &mut assembled[(i * SECTOR_SIZE) as usize..((i + 1) * SECTOR_SIZE) as usize];
            self.read_sector((start_sector + i) as u32, chunk)?;
        }
        buf.copy_from_slice(&assembled[in_sector as usize..in_sector as usize + buf.len()]);
        Ok(())
    }

    fn image_offset(&self) -> u64 {
        match self {
            Source::Xiso(s) => s.image_offset(),
            _ => 0,
        }
    }

    fn total_sectors(&self) -> u32 {
        match self {
            Source::Xiso(s) => s.total_sectors(),
            Source::Cci(s) => s.total_sectors(),
            Source::Cso(s) => s.total_sectors(),
            Source::God(s) => s.total_sectors(),
        }
    }
}

pub struct ImageReader {
    source: Source,
    name: String,
    directory_entries: Option<Vec<DirectoryEntry>>,
    executable: Option<DirectoryEntry>,
    data_sectors: Option<HashSet<u32>>,
    max_data_sector: u32,
    total_file_bytes: u64,
    file_time: Option<FileTime>,
    platform: Option<Platform>,
}

impl ImageReader {
    pub fn open_xiso<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let name = stem_of(paths)?;
        Ok(Self::new(Source::Xiso(XisoSource::open(paths)?), name))
    }

    pub fn open_cci<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let name = stem_of(paths)?;
        Ok(Self::new(Source::Cci(CciSource::open(paths)?), name))
    }

    pub fn open_cso<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let name = stem_of(paths)?;
        Ok(Self::new(Source::Cso(CsoSource::open(paths)?), name))
    }

    /// Opens a GoD content directory (the `*.data` directory or any parent
    /// within reach of its Data files).
    pub fn open_god(directory: &Path) -> Result<Self> {
        let name = directory
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".into());
        Ok(Self::new(Source::God(GodSource::open(directory)?), name))
    }

    fn new(source: Source, name: String) -> Self {
        Self {
            source,
            name,
            directory_entries: None,
            executable: None,
            data_sectors: None,
            max_data_sector: 0,
            total_file_bytes: 0,
            file_time: None,
            platform: None,
        }
    }

    /// The input's display name (file stem or directory name).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_offset(&self) -> u64 {
        self.source.image_offset()
    }

    pub fn total_sectors(&self) -> u32 {
        self.source.total_sectors()
    }

    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        self.source.read_sector(sector, buf)
    }

    pub fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.source.read_bytes(offset, buf)
    }

    /// The flat entry list, directories first, then by path.
    pub fn directory_entries(&mut self) -> Result<&[DirectoryEntry]> {
        if self.directory_entries.is_none() {
            let entries = walker::directory_entries(&mut self.source)?;
            self.total_file_bytes = entries
                .iter()
                .filter(|e| !e.header.is_directory())
                .map(|e| e.header.file_size.get() as u64)
                .sum();
            self.directory_entries = Some(entries);
        }
        Ok(self.directory_entries.as_deref().unwrap())
    }

    /// The boot executable: the first `default.xex` or `default.xbe` found
    /// during the walk.
    pub fn executable_entry(&mut self) -> Result<&DirectoryEntry> {
        if self.executable.is_none() {
            self.executable = Some(walker::executable_entry(&mut self.source)?);
        }
        Ok(self.executable.as_ref().unwrap())
    }

    pub fn platform(&mut self) -> Result<Platform> {
        if self.platform.is_none() {
            let name = self.executable_entry()?.filename.to_lowercase();
            self.platform = Some(if name.ends_with(".xex") {
                Platform::X360
            } else if name.ends_with(".xbe") {
                Platform::Ogx
            } else {
                return Err(Error::Other(format!("unknown executable type: {name}")));
            });
        }
        Ok(self.platform.unwrap())
    }

    /// The volume timestamp from the image header.
    pub fn file_time(&mut self) -> Result<FileTime> {
        if self.file_time.is_none() {
            let mut bytes = [0u8; 8];
            let offset = self.image_offset() + MAGIC_OFFSET + 20 + 8;
            self.source.read_bytes(offset, &mut bytes)?;
            self.file_time = Some(bytemuck::pod_read_unaligned(&bytes));
        }
        Ok(self.file_time.unwrap())
    }

    /// Total bytes of file data in the image.
    pub fn total_file_bytes(&mut self) -> Result<u64> {
        self.directory_entries()?;
        Ok(self.total_file_bytes)
    }

    /// Every sector that must be carried into a scrubbed output: directory
    /// tables, file data, and (for Redump-sized OG Xbox images) the security
    /// sector runs. Anything else is padding.
    pub fn data_sectors(&mut self) -> Result<&HashSet<u32>> {
        if self.data_sectors.is_none() {
            let mut sectors = walker::data_sectors(&mut self.source)?;
            self.max_data_sector = sectors.iter().copied().max().unwrap_or(0);

            let security = if self.platform()? == Platform::Ogx {
                walker::security_sectors(&mut self.source, &sectors)?
            } else {
                None
            };
            match security {
                Some(security) => sectors.extend(security),
                None => {
                    // Xbox 360 or an already-compact image: keep everything
                    // up to the last data sector.
                    let first = (self.source.image_offset() / SECTOR_SIZE) as u32;
                    sectors.extend(first..self.max_data_sector);
                }
            }
            self.data_sectors = Some(sectors);
        }
        Ok(self.data_sectors.as_ref().unwrap())
    }

    pub fn max_data_sector(&mut self) -> Result<u32> {
        self.data_sectors()?;
        Ok(self.max_data_sector)
    }
}

fn stem_of<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    let first = paths
        .first()
        .ok_or_else(|| Error::Other("no input paths".into()))?;
    let stem = first
        .as_ref()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    // A split member's stem still carries its part number.
    Ok(stem.strip_suffix(".1").unwrap_or(&stem).to_string())
}
