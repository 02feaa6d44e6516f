//! GoD output: XISO sectors remapped into hash-tree-wrapped Data parts
//! under a Live container header.
//!
//! The conversion runs in four strictly ordered phases: write the data
//! blocks through the sector remap, fill the per-part hash tables, link the
//! parts' master tables back-to-front, then patch and hash the Live header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::avl::iter::write_events;
use crate::avl::AvlTree;
use crate::cancel::CancelToken;
use crate::formats::god::{self, live};
use crate::layout::{build_volume_header, num_sectors, PAD_BYTE, SECTOR_SIZE};
use crate::read::ImageReader;
use crate::title::TitleHelper;
use crate::write::{directory_to_buffer, DataSource};
use crate::{create_dir_all, Error, Platform, Result, ScrubType};

pub struct GodWriter<'r, 't> {
    reader: Option<&'r mut ImageReader>,
    source_dir: Option<PathBuf>,
    scrub: ScrubType,
    title: &'t TitleHelper,
}

impl<'r, 't> GodWriter<'r, 't> {
    pub fn from_reader(
        reader: &'r mut ImageReader,
        title: &'t TitleHelper,
        scrub: ScrubType,
    ) -> Self {
        Self {
            reader: Some(reader),
            source_dir: None,
            scrub,
            title,
        }
    }

    pub fn from_dir(source_dir: &Path, title: &'t TitleHelper) -> Self {
        Self {
            reader: None,
            source_dir: Some(source_dir.to_path_buf()),
            scrub: ScrubType::Full,
            title,
        }
    }

    /// Writes the content directory under `out_directory`:
    /// `<content-type>/<unique-name>.data/Data####` plus the Live header
    /// file beside the `.data` directory.
    pub fn convert(mut self, out_directory: &Path, token: &CancelToken) -> Result<Vec<PathBuf>> {
        let content_type = match self.title.platform() {
            Platform::X360 => god::CONTENT_GAMES_ON_DEMAND,
            Platform::Ogx => god::CONTENT_ORIGINAL_XBOX,
        };
        let type_dir = out_directory.join(format!("{content_type:08X}"));
        let data_dir = type_dir.join(format!("{}.data", self.title.unique_name()));
        let live_path = type_dir.join(self.title.unique_name());
        create_dir_all(&data_dir)?;

        let part_paths = if let Some(dir) = self.source_dir.take() {
            let tree = AvlTree::from_dir(
                &dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                &dir,
            )?;
            self.write_data_from_avl(tree, DataSource::Filesystem, &data_dir, token)?
        } else {
            let reader = self
                .reader
                .take()
                .ok_or_else(|| Error::Other("god writer needs a reader or a directory".into()))?;
            if self.scrub == ScrubType::Full {
                let name = reader.name().to_string();
                let tree = AvlTree::from_entries(&name, reader.directory_entries()?)?;
                self.write_data_from_avl(tree, DataSource::Reader(reader), &data_dir, token)?
            } else {
                self.write_data_pass_through(reader, &data_dir, token)?
            }
        };

        write_hashtables(&part_paths, token)?;
        let final_mht_hash = link_hashtables(&part_paths)?;
        self.write_live_header(&live_path, &part_paths, &final_mht_hash, content_type)?;

        Ok(vec![out_directory.to_path_buf()])
    }

    fn write_data_from_avl(
        &self,
        tree: AvlTree,
        mut source: DataSource,
        data_dir: &Path,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let iso_size = tree.iso_size();
        let total_sectors = num_sectors(iso_size);
        let total_blocks = god::num_blocks(iso_size);
        let mut parts = GodParts::create(data_dir, god::num_parts(total_blocks))?;

        tracing::info!(
            files = tree.total_files(),
            bytes = tree.total_bytes(),
            parts = parts.files.len(),
            "writing GoD data files"
        );

        let root = tree.node(tree.root());
        let header = build_volume_header(
            root.start_sector as u32,
            root.file_size as u32,
            total_sectors as u32,
            source.file_time()?,
        );
        for (i, sector) in header.chunks_exact(SECTOR_SIZE as usize).enumerate() {
            parts.write_sector(i as u64, sector)?;
        }
        let mut current_sector = (header.len() as u64) / SECTOR_SIZE;

        let events = write_events(&tree);
        // Zeros up to the first event; pad bytes only between events.
        if let Some(first) = events.first() {
            let gap = first.offset / SECTOR_SIZE - current_sector;
            parts.write_pad_sectors(current_sector, gap, 0x00)?;
            current_sector += gap;
        }
        let mut index = 0;
        while index < events.len() {
            token.checkpoint()?;
            let event = events[index];
            let event_sector = event.offset / SECTOR_SIZE;

            if current_sector < event_sector {
                parts.write_pad_sectors(current_sector, event_sector - current_sector, PAD_BYTE)?;
                current_sector = event_sector;
            }
            if event.offset != current_sector * SECTOR_SIZE {
                return Err(Error::Other("GoD output has become misaligned".into()));
            }

            if event.directory_entry {
                let (buffer, processed) = directory_to_buffer(&tree, &events, index);
                index += processed;
                for sector in buffer.chunks_exact(SECTOR_SIZE as usize) {
                    parts.write_sector(current_sector, sector)?;
                    current_sector += 1;
                }
            } else {
                source.copy_file_sectors(&tree, event.node, 16, |chunk| {
                    token.checkpoint()?;
                    for sector in chunk.chunks_exact(SECTOR_SIZE as usize) {
                        parts.write_sector(current_sector, sector)?;
                        current_sector += 1;
                    }
                    Ok(())
                })?;
                index += 1;
            }
        }

        if current_sector < total_sectors {
            parts.write_pad_sectors(current_sector, total_sectors - current_sector, 0x00)?;
        }
        parts.pad_last_to_block()?;
        Ok(parts.finish())
    }

    fn write_data_pass_through(
        &self,
        reader: &mut ImageReader,
        data_dir: &Path,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let scrub = self.scrub == ScrubType::Partial;
        let sector_offset = (reader.image_offset() / SECTOR_SIZE) as u32;
        let mut end_sector = reader.total_sectors();
        if scrub {
            end_sector = end_sector.min(reader.max_data_sector()? + 1);
        }
        let zero_padding = scrub && reader.platform()? == Platform::Ogx;

        let total_out_sectors = (end_sector - sector_offset) as u64;
        let total_blocks = god::num_blocks(total_out_sectors * SECTOR_SIZE);
        let mut parts = GodParts::create(data_dir, god::num_parts(total_blocks))?;

        tracing::info!(
            sectors = total_out_sectors,
            parts = parts.files.len(),
            "writing GoD data files"
        );

        let mut buffer = vec![0u8; SECTOR_SIZE as usize];
        for sector in sector_offset..end_sector {
            token.checkpoint()?;
            let keep = !zero_padding || reader.data_sectors()?.contains(&sector);
            if keep {
                reader.read_sector(sector, &mut buffer)?;
            } else {
                buffer.fill(0);
            }
            parts.write_sector((sector - sector_offset) as u64, &buffer)?;
        }

        parts.pad_last_to_block()?;
        Ok(parts.finish())
    }

    fn write_live_header(
        &self,
        live_path: &Path,
        part_paths: &[PathBuf],
        final_mht_hash: &[u8],
        content_type: u32,
    ) -> Result<()> {
        tracing::info!(path = %live_path.display(), "writing Live header");
        let mut header = vec![0u8; god::LIVE_HEADER_SIZE];
        header[0..4].copy_from_slice(b"LIVE");

        let cert = self.title.xex_cert();
        header[live::CONTENT_TYPE..live::CONTENT_TYPE + 4]
            .copy_from_slice(&content_type.to_be_bytes());
        header[live::MEDIA_ID..live::MEDIA_ID + 4]
            .copy_from_slice(bytemuck::bytes_of(&cert.media_id));
        header[live::TITLE_ID..live::TITLE_ID + 4]
            .copy_from_slice(bytemuck::bytes_of(&cert.title_id));
        header[live::PLATFORM] = cert.platform;
        header[live::EXECUTABLE_TYPE] = cert.executable_type;
        header[live::DISC_NUMBER] = cert.disc_number;
        header[live::DISC_COUNT] = cert.disc_count;
        header[live::MASTER_HASH..live::MASTER_HASH + god::SHA1_LEN]
            .copy_from_slice(final_mht_hash);

        let mut parts_total: u64 = 0;
        for path in part_paths {
            parts_total += std::fs::metadata(path)?.len();
        }
        header[live::PART_COUNT..live::PART_COUNT + 4]
            .copy_from_slice(&(part_paths.len() as u32).to_le_bytes());
        header[live::PARTS_SIZE..live::PARTS_SIZE + 4]
            .copy_from_slice(&((parts_total / 0x100) as u32).to_be_bytes());

        let mut title_bytes = Vec::with_capacity(live::TITLE_NAME_BYTES);
        for unit in self.title.utf16_title() {
            title_bytes.extend_from_slice(&unit.to_le_bytes());
        }
        title_bytes.truncate(live::TITLE_NAME_BYTES);
        header[live::TITLE_NAME_1..live::TITLE_NAME_1 + title_bytes.len()]
            .copy_from_slice(&title_bytes);
        header[live::TITLE_NAME_2..live::TITLE_NAME_2 + title_bytes.len()]
            .copy_from_slice(&title_bytes);

        let icon = self.title.icon();
        let icon_size = if icon.is_empty() { 20 } else { icon.len() as u32 };
        header[live::ICON_SIZE_1..live::ICON_SIZE_1 + 4]
            .copy_from_slice(&icon_size.to_be_bytes());
        header[live::ICON_SIZE_2..live::ICON_SIZE_2 + 4]
            .copy_from_slice(&icon_size.to_be_bytes());
        if !icon.is_empty() {
            header[live::ICON_1..live::ICON_1 + icon.len()].copy_from_slice(icon);
            header[live::ICON_2..live::ICON_2 + icon.len()].copy_from_slice(icon);
        }

        let digest = Sha1::digest(&header[live::CONTENT_TYPE..]);
        header[live::HEADER_HASH..live::HEADER_HASH + god::SHA1_LEN].copy_from_slice(&digest);

        let mut file = File::create(live_path).map_err(|source| Error::FileOpen {
            path: live_path.to_path_buf(),
            source,
        })?;
        file.write_all(&header)?;
        Ok(())
    }
}

/// The set of open Data part files, addressed by XISO sector.
struct GodParts {
    files: Vec<File>,
    paths: Vec<PathBuf>,
}

impl GodParts {
    fn create(data_dir: &Path, count: u32) -> Result<Self> {
        let mut files = Vec::with_capacity(count as usize);
        let mut paths = Vec::with_capacity(count as usize);
        for i in 0..count {
            let path = data_dir.join(format!("Data{i:04}"));
            files.push(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|source| Error::FileOpen {
                        path: path.clone(),
                        source,
                    })?,
            );
            paths.push(path);
        }
        Ok(Self { files, paths })
    }

    fn write_sector(&mut self, iso_sector: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u64, SECTOR_SIZE);
        let remap = god::remap_sector(iso_sector);
        let file = self
            .files
            .get_mut(remap.part as usize)
            .ok_or_else(|| Error::Other(format!("sector {iso_sector} beyond planned parts")))?;
        file.seek(SeekFrom::Start(remap.offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn write_pad_sectors(&mut self, start_sector: u64, count: u64, pad_byte: u8) -> Result<()> {
        let pad = vec![pad_byte; SECTOR_SIZE as usize];
        for i in 0..count {
            self.write_sector(start_sector + i, &pad)?;
        }
        Ok(())
    }

    /// Zero-pads the last part out to a whole block.
    fn pad_last_to_block(&mut self) -> Result<()> {
        let file = self.files.last_mut().expect("at least one part");
        let len = file.seek(SeekFrom::End(0))?;
        if len % god::BLOCK_SIZE != 0 {
            let padding = god::BLOCK_SIZE - len % god::BLOCK_SIZE;
            file.write_all(&vec![0u8; padding as usize])?;
        }
        Ok(())
    }

    fn finish(self) -> Vec<PathBuf> {
        self.paths
    }
}

/// Phase 2: hash every data block into its sub-hashtable, and every
/// sub-hashtable into the part's master hashtable.
fn write_hashtables(part_paths: &[PathBuf], token: &CancelToken) -> Result<()> {
    tracing::info!(parts = part_paths.len(), "writing hash tables");
    for path in part_paths {
        token.checkpoint()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::FileOpen {
                path: path.clone(),
                source,
            })?;

        let total_blocks = std::fs::metadata(path)?.len() / god::BLOCK_SIZE;
        // Group length is one sub-hashtable plus its data blocks.
        let group = god::DATA_BLOCKS_PER_SHT as u64 + 1;
        let sub_hashtables = (total_blocks.saturating_sub(1)).div_ceil(group);

        let mut master_hashtable = Vec::with_capacity(sub_hashtables as usize * god::SHA1_LEN);
        let mut block = vec![0u8; god::BLOCK_SIZE as usize];
        let mut blocks_left = total_blocks - 1; // minus the master table

        for sht_index in 0..sub_hashtables {
            token.checkpoint()?;
            let mut sub_hashtable = vec![0u8; god::BLOCK_SIZE as usize];
            let sht_offset = (sht_index * group + 1) * god::BLOCK_SIZE;
            blocks_left -= 1; // the sub-hashtable itself

            let data_blocks = blocks_left.min(god::DATA_BLOCKS_PER_SHT as u64);
            file.seek(SeekFrom::Start(sht_offset + god::BLOCK_SIZE))?;
            for i in 0..data_blocks {
                file.read_exact(&mut block)?;
                let digest = Sha1::digest(&block);
                let at = i as usize * god::SHA1_LEN;
                sub_hashtable[at..at + god::SHA1_LEN].copy_from_slice(&digest);
            }
            blocks_left -= data_blocks;

            file.seek(SeekFrom::Start(sht_offset))?;
            file.write_all(&sub_hashtable)?;
            master_hashtable.extend_from_slice(&Sha1::digest(&sub_hashtable));
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&master_hashtable)?;
        file.flush()?;
    }
    Ok(())
}

/// Phase 3: each part's master-table hash is written into the previous
/// part's master table; the hash of part 0's finished master table seals the
/// chain.
fn link_hashtables(part_paths: &[PathBuf]) -> Result<Vec<u8>> {
    for i in (1..part_paths.len()).rev() {
        let mut current = File::open(&part_paths[i]).map_err(|source| Error::FileOpen {
            path: part_paths[i].clone(),
            source,
        })?;
        let mut master = vec![0u8; god::BLOCK_SIZE as usize];
        current.read_exact(&mut master)?;
        let digest = Sha1::digest(&master);

        let mut previous = OpenOptions::new()
            .write(true)
            .open(&part_paths[i - 1])
            .map_err(|source| Error::FileOpen {
                path: part_paths[i - 1].clone(),
                source,
            })?;
        previous.seek(SeekFrom::Start(god::MASTER_LINK_OFFSET))?;
        previous.write_all(&digest)?;
        previous.flush()?;
    }

    let mut first = File::open(&part_paths[0]).map_err(|source| Error::FileOpen {
        path: part_paths[0].clone(),
        source,
    })?;
    let mut master = vec![0u8; god::BLOCK_SIZE as usize];
    first.read_exact(&mut master)?;
    Ok(Sha1::digest(&master).to_vec())
}
