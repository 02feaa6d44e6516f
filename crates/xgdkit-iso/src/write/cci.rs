//! CCI output: one LZ4 block per sector behind a packed index.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::avl::iter::write_events;
use crate::avl::AvlTree;
use crate::cancel::CancelToken;
use crate::formats::cci;
use crate::layout::{build_volume_header, num_sectors, PAD_BYTE, SECTOR_SIZE};
use crate::read::ImageReader;
use crate::write::{directory_to_buffer, part_paths, resolve_out_paths, DataSource};
use crate::{create_dir_all, Error, Platform, Result, ScrubType};

const ALIGNMENT: u64 = 1 << cci::INDEX_ALIGNMENT;

pub struct CciWriter<'r> {
    reader: Option<&'r mut ImageReader>,
    source_dir: Option<PathBuf>,
    scrub: ScrubType,
}

impl<'r> CciWriter<'r> {
    pub fn from_reader(reader: &'r mut ImageReader, scrub: ScrubType) -> Self {
        Self {
            reader: Some(reader),
            source_dir: None,
            scrub,
        }
    }

    pub fn from_dir(source_dir: &Path) -> Self {
        Self {
            reader: None,
            source_dir: Some(source_dir.to_path_buf()),
            scrub: ScrubType::Full,
        }
    }

    pub fn convert(mut self, out_path: &Path, token: &CancelToken) -> Result<Vec<PathBuf>> {
        if let Some(parent) = out_path.parent() {
            create_dir_all(parent)?;
        }
        let (part_1, part_2) = part_paths(out_path);
        let mut output = CciOutput::create(part_1.clone(), part_2.clone())?;

        if let Some(dir) = self.source_dir.take() {
            let tree = AvlTree::from_dir(
                &dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                &dir,
            )?;
            self.from_avl(tree, DataSource::Filesystem, &mut output, token)?;
        } else {
            let reader = self
                .reader
                .take()
                .ok_or_else(|| Error::Other("cci writer needs a reader or a directory".into()))?;
            if self.scrub == ScrubType::Full {
                let name = reader.name().to_string();
                let tree = AvlTree::from_entries(&name, reader.directory_entries()?)?;
                self.from_avl(tree, DataSource::Reader(reader), &mut output, token)?;
            } else {
                self.pass_through(reader, &mut output, token)?;
            }
        }

        output.finalize()?;
        resolve_out_paths(out_path.to_path_buf(), part_1, part_2)
    }

    fn pass_through(
        &self,
        reader: &mut ImageReader,
        output: &mut CciOutput,
        token: &CancelToken,
    ) -> Result<()> {
        let scrub = self.scrub == ScrubType::Partial;
        let sector_offset = (reader.image_offset() / SECTOR_SIZE) as u32;
        let mut end_sector = reader.total_sectors();
        if scrub {
            end_sector = end_sector.min(reader.max_data_sector()? + 1);
        }
        let zero_padding = scrub && reader.platform()? == Platform::Ogx;

        tracing::info!(sectors = end_sector - sector_offset, "writing CCI");
        let mut buffer = vec![0u8; SECTOR_SIZE as usize];
        for sector in sector_offset..end_sector {
            token.checkpoint()?;
            let keep = !zero_padding || reader.data_sectors()?.contains(&sector);
            if keep {
                reader.read_sector(sector, &mut buffer)?;
            } else {
                buffer.fill(0);
            }
            output.write_sector(&buffer)?;
        }
        Ok(())
    }

    fn from_avl(
        &self,
        tree: AvlTree,
        mut source: DataSource,
        output: &mut CciOutput,
        token: &CancelToken,
    ) -> Result<()> {
        let events = write_events(&tree);
        let total_sectors = num_sectors(tree.iso_size());

        tracing::info!(
            files = tree.total_files(),
            bytes = tree.total_bytes(),
            "writing CCI"
        );

        let root = tree.node(tree.root());
        let header = build_volume_header(
            root.start_sector as u32,
            root.file_size as u32,
            total_sectors as u32,
            source.file_time()?,
        );
        for sector in header.chunks_exact(SECTOR_SIZE as usize) {
            output.write_sector(sector)?;
        }

        let pad_sector = [PAD_BYTE; SECTOR_SIZE as usize];
        let zero_sector = [0u8; SECTOR_SIZE as usize];

        // The stretch between the header and the first event is zeros; only
        // gaps between events are pad bytes.
        if let Some(first) = events.first() {
            while output.sectors_written < first.offset / SECTOR_SIZE {
                output.write_sector(&zero_sector)?;
            }
        }

        let mut index = 0;
        while index < events.len() {
            token.checkpoint()?;
            let event = events[index];
            let event_sector = event.offset / SECTOR_SIZE;

            // Fill the gap to the next event.
            while output.sectors_written < event_sector {
                output.write_sector(&pad_sector)?;
            }
            if output.sectors_written != event_sector || event.offset % SECTOR_SIZE != 0 {
                return Err(Error::Other("CCI output has become misaligned".into()));
            }

            if event.directory_entry {
                let (buffer, processed) = directory_to_buffer(&tree, &events, index);
                index += processed;
                for sector in buffer.chunks_exact(SECTOR_SIZE as usize) {
                    output.write_sector(sector)?;
                }
            } else {
                source.copy_file_sectors(&tree, event.node, 16, |chunk| {
                    token.checkpoint()?;
                    for sector in chunk.chunks_exact(SECTOR_SIZE as usize) {
                        output.write_sector(sector)?;
                    }
                    Ok(())
                })?;
                index += 1;
            }
        }

        while output.sectors_written < total_sectors {
            output.write_sector(&zero_sector)?;
        }
        Ok(())
    }
}

struct IndexRecord {
    size: u32,
    compressed: bool,
}

/// The physical CCI stream: sequential records, a per-part index and header,
/// rolling to a second part past the split offset.
struct CciOutput {
    file: File,
    part_2_path: PathBuf,
    on_part_2: bool,
    position: u64,
    records: Vec<IndexRecord>,
    /// Across both parts; drives gap arithmetic in AVL mode.
    sectors_written: u64,
}

impl CciOutput {
    fn create(part_1: PathBuf, part_2: PathBuf) -> Result<Self> {
        let file = open_part(&part_1)?;
        Ok(Self {
            file,
            part_2_path: part_2,
            on_part_2: false,
            position: 0,
            records: Vec::new(),
            sectors_written: 0,
        })
    }

    fn write_sector(&mut self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u64, SECTOR_SIZE);
        if self.position == 0 {
            // Reserve room for the header; patched in finalize.
            self.file.write_all(&[0u8; cci::HEADER_SIZE as usize])?;
            self.position = cci::HEADER_SIZE as u64;
        }

        let mut compressed = vec![0u8; SECTOR_SIZE as usize];
        let record = match lz4_flex::block::compress_into(data, &mut compressed) {
            Ok(size) if size > 0 && (size as u64) < SECTOR_SIZE - (1 + ALIGNMENT) => {
                let padding = (size as u64 + 1).div_ceil(ALIGNMENT) * ALIGNMENT - (size as u64 + 1);
                self.file.write_all(&[padding as u8])?;
                self.file.write_all(&compressed[..size])?;
                self.file.write_all(&vec![0u8; padding as usize])?;
                IndexRecord {
                    size: (1 + size as u64 + padding) as u32,
                    compressed: true,
                }
            }
            _ => {
                self.file.write_all(data)?;
                IndexRecord {
                    size: SECTOR_SIZE as u32,
                    compressed: false,
                }
            }
        };
        self.position += record.size as u64;
        self.records.push(record);
        self.sectors_written += 1;

        if self.position > cci::SPLIT_OFFSET && !self.on_part_2 {
            self.finalize()?;
            let part_2 = self.part_2_path.clone();
            self.file = open_part(&part_2)?;
            self.on_part_2 = true;
            self.position = 0;
            self.records.clear();
        }
        Ok(())
    }

    /// Appends the current part's index and patches its header.
    fn finalize(&mut self) -> Result<()> {
        if self.position == 0 {
            self.file.write_all(&[0u8; cci::HEADER_SIZE as usize])?;
            self.position = cci::HEADER_SIZE as u64;
        }
        self.file.seek(SeekFrom::End(0))?;
        let index_offset = self.position;

        let mut record_position = cci::HEADER_SIZE;
        for record in &self.records {
            let word = (record_position >> cci::INDEX_ALIGNMENT)
                | if record.compressed {
                    cci::INDEX_COMPRESSED
                } else {
                    0
                };
            self.file.write_all(&word.to_le_bytes())?;
            record_position += record.size;
        }
        self.file
            .write_all(&(record_position >> cci::INDEX_ALIGNMENT).to_le_bytes())?;

        let header = cci::Header::new(self.records.len() as u64 * SECTOR_SIZE, index_offset);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytemuck::bytes_of(&header))?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.flush()?;
        Ok(())
    }
}

fn open_part(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })
}
