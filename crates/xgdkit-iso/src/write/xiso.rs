//! Raw XISO output.

use std::path::{Path, PathBuf};

use crate::avl::{AvlTree, Kind, NodeId};
use crate::cancel::CancelToken;
use crate::layout::{
    build_volume_header, num_sectors, FILE_MODULUS, PAD_BYTE, SECTOR_SIZE, SPLIT_MARGIN,
};
use crate::read::ImageReader;
use crate::split::SplitWriter;
use crate::write::DataSource;
use crate::{create_dir_all, Error, Platform, Result, ScrubType};

/// Copy chunk for file data, in sectors.
const COPY_CHUNK_SECTORS: u64 = 32;

pub struct XisoWriter<'r> {
    reader: Option<&'r mut ImageReader>,
    source_dir: Option<PathBuf>,
    scrub: ScrubType,
    split: bool,
}

impl<'r> XisoWriter<'r> {
    pub fn from_reader(reader: &'r mut ImageReader, scrub: ScrubType, split: bool) -> Self {
        Self {
            reader: Some(reader),
            source_dir: None,
            scrub,
            split,
        }
    }

    pub fn from_dir(source_dir: &Path, split: bool) -> Self {
        Self {
            reader: None,
            source_dir: Some(source_dir.to_path_buf()),
            scrub: ScrubType::Full,
            split,
        }
    }

    /// Writes the image, returning the paths produced (one, or two when
    /// split).
    pub fn convert(mut self, out_path: &Path, token: &CancelToken) -> Result<Vec<PathBuf>> {
        if let Some(parent) = out_path.parent() {
            create_dir_all(parent)?;
        }

        if let Some(dir) = self.source_dir.take() {
            let tree = AvlTree::from_dir(
                &dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                &dir,
            )?;
            return self.rewrite(tree, DataSource::Filesystem, out_path, token);
        }

        let reader = self.reader.take().ok_or_else(|| {
            Error::Other("xiso writer needs a reader or a source directory".into())
        })?;
        if self.scrub == ScrubType::Full {
            let name = reader.name().to_string();
            let tree = AvlTree::from_entries(&name, reader.directory_entries()?)?;
            return self.rewrite(tree, DataSource::Reader(reader), out_path, token);
        }
        self.pass_through(reader, out_path, token)
    }

    /// Sector copy, optionally zeroing non-data sectors and trimming the
    /// tail.
    fn pass_through(
        &self,
        reader: &mut ImageReader,
        out_path: &Path,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let scrub = self.scrub == ScrubType::Partial;
        let sector_offset = (reader.image_offset() / SECTOR_SIZE) as u32;
        let mut end_sector = reader.total_sectors();
        if scrub {
            end_sector = end_sector.min(reader.max_data_sector()? + 1);
        }
        let zero_padding = scrub && reader.platform()? == Platform::Ogx;

        let cut = if self.split { SPLIT_MARGIN } else { u64::MAX };
        let mut out_file = SplitWriter::create(out_path, cut)?;
        let mut buffer = vec![0u8; SECTOR_SIZE as usize];

        tracing::info!(sectors = end_sector - sector_offset, "writing XISO");
        for sector in sector_offset..end_sector {
            token.checkpoint()?;
            let keep = !zero_padding || reader.data_sectors()?.contains(&sector);
            if keep {
                reader.read_sector(sector, &mut buffer)?;
            } else {
                buffer.fill(0);
            }
            out_file.write_all(&buffer)?;
        }
        out_file.close()
    }

    /// Full rewrite from an AVL plan.
    fn rewrite(
        &self,
        tree: AvlTree,
        mut source: DataSource,
        out_path: &Path,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let cut = if self.split { SPLIT_MARGIN } else { u64::MAX };
        let mut out_file = SplitWriter::create(out_path, cut)?;

        tracing::info!(
            files = tree.total_files(),
            bytes = tree.total_bytes(),
            "writing XISO"
        );

        let root = tree.node(tree.root());
        let header = build_volume_header(
            root.start_sector as u32,
            root.file_size as u32,
            (tree.iso_size() / SECTOR_SIZE) as u32,
            source.file_time()?,
        );
        out_file.write_all(&header)?;

        out_file.seek_to(root.start_sector * SECTOR_SIZE)?;
        self.write_tree(&tree, tree.root(), &mut source, &mut out_file, token)?;

        out_file.seek_end()?;
        out_file.pad_to_modulus(FILE_MODULUS, 0x00)?;
        out_file.close()
    }

    /// Emits one directory: its files, its subdirectories, then its table.
    fn write_tree(
        &self,
        tree: &AvlTree,
        id: NodeId,
        source: &mut DataSource,
        out_file: &mut SplitWriter,
        token: &CancelToken,
    ) -> Result<()> {
        match tree.node(id).kind {
            Kind::File => Ok(()),
            Kind::EmptyDir => {
                let pad_sector = vec![PAD_BYTE; SECTOR_SIZE as usize];
                out_file.seek_to(tree.node(id).start_sector * SECTOR_SIZE)?;
                out_file.write_all(&pad_sector)
            }
            Kind::Dir(subtree) => {
                let order = tree.preorder(subtree);
                for &child in &order {
                    if tree.node(child).kind == Kind::File {
                        self.write_file(tree, child, source, out_file, token)?;
                    }
                }
                for &child in &order {
                    self.write_tree(tree, child, source, out_file, token)?;
                }

                out_file.seek_to(tree.node(id).start_sector * SECTOR_SIZE)?;
                for &child in &order {
                    let node = tree.node(child);
                    let entry_start = node.directory_start + node.offset;
                    debug_assert!(out_file.stream_position() <= entry_start);
                    let padding =
                        vec![PAD_BYTE; (entry_start - out_file.stream_position()) as usize];
                    out_file.write_all(&padding)?;

                    let header = super::entry_header(tree, child);
                    out_file.write_all(bytemuck::bytes_of(&header))?;
                    out_file.write_all(&node.name_bytes[..header.name_length as usize])?;
                }
                out_file.pad_to_modulus(SECTOR_SIZE, PAD_BYTE)
            }
        }
    }

    fn write_file(
        &self,
        tree: &AvlTree,
        id: NodeId,
        source: &mut DataSource,
        out_file: &mut SplitWriter,
        token: &CancelToken,
    ) -> Result<()> {
        token.checkpoint()?;
        let node = tree.node(id);
        out_file.seek_to(node.start_sector * SECTOR_SIZE)?;
        source.copy_file_sectors(tree, id, COPY_CHUNK_SECTORS, |chunk| {
            token.checkpoint()?;
            out_file.write_all(chunk)
        })?;

        let end = node.start_sector * SECTOR_SIZE + num_sectors(node.file_size) * SECTOR_SIZE;
        if out_file.stream_position() != end {
            return Err(Error::Other(format!(
                "file write size mismatch: {}",
                node.filename
            )));
        }
        Ok(())
    }
}
