//! Output writers for every supported container.
//!
//! Each writer runs in one of two modes, mirroring the planning split:
//! sector pass-through (optionally scrubbed) straight from a reader, or a
//! full rewrite driven by an [`crate::avl::AvlTree`] plan and its
//! offset-sorted write events.

pub mod cci;
pub mod cso;
pub mod god;
pub mod xiso;

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use xgdkit_common::time::FileTime;

use crate::avl::iter::WriteEvent;
use crate::avl::{AvlTree, NodeId};
use crate::layout::{DirentHeader, EntryAttributes, PAD_BYTE, SECTOR_SIZE};
use crate::read::ImageReader;
use crate::{Error, Result};

/// Where file bytes come from during a full rewrite.
pub(crate) enum DataSource<'r> {
    Reader(&'r mut ImageReader),
    Filesystem,
}

impl DataSource<'_> {
    pub(crate) fn file_time(&mut self) -> Result<FileTime> {
        match self {
            DataSource::Reader(reader) => reader.file_time(),
            DataSource::Filesystem => Ok(FileTime::now()),
        }
    }

    /// Streams one planned file's bytes in sector-aligned chunks of at most
    /// `chunk_sectors` sectors, the final partial sector padded with `0xFF`.
    pub(crate) fn copy_file_sectors(
        &mut self,
        tree: &AvlTree,
        node: NodeId,
        chunk_sectors: u64,
        mut sink: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let node = tree.node(node);
        let mut remaining = node.file_size;
        let mut chunk = vec![0u8; (chunk_sectors * SECTOR_SIZE) as usize];

        let mut local = match self {
            DataSource::Reader(_) => None,
            DataSource::Filesystem => {
                Some(File::open(&node.path).map_err(|source| Error::FileOpen {
                    path: node.path.clone(),
                    source,
                })?)
            }
        };
        let mut read_position = node.old_start_sector * SECTOR_SIZE;
        if let DataSource::Reader(reader) = self {
            read_position += reader.image_offset();
        }

        while remaining > 0 {
            let read_size = remaining.min(chunk.len() as u64);
            match self {
                DataSource::Reader(reader) => {
                    reader.read_bytes(read_position, &mut chunk[..read_size as usize])?;
                }
                DataSource::Filesystem => {
                    local
                        .as_mut()
                        .expect("file opened above")
                        .read_exact(&mut chunk[..read_size as usize])?;
                }
            }
            let padded = read_size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
            chunk[read_size as usize..padded as usize].fill(PAD_BYTE);
            sink(&chunk[..padded as usize])?;
            remaining -= read_size;
            read_position += read_size;
        }
        Ok(())
    }
}

/// The on-disc header of one planned node's directory entry.
pub(crate) fn entry_header(tree: &AvlTree, id: NodeId) -> DirentHeader {
    let node = tree.node(id);
    let word = |child: Option<NodeId>| {
        child
            .map(|c| (tree.node(c).offset / 4) as u16)
            .unwrap_or(0)
    };
    // Directory sizes serialize rounded up to whole sectors; the in-memory
    // plan keeps them exact.
    let file_size = if node.is_directory() {
        node.file_size + (SECTOR_SIZE - node.file_size % SECTOR_SIZE) % SECTOR_SIZE
    } else {
        node.file_size
    };
    let attributes = if node.is_directory() {
        EntryAttributes::DIRECTORY
    } else {
        EntryAttributes::FILE
    };
    DirentHeader {
        left_offset: xgdkit_common::types::number::U16Le::new(word(node.left)),
        right_offset: xgdkit_common::types::number::U16Le::new(word(node.right)),
        start_sector: xgdkit_common::types::number::U32Le::new(node.start_sector as u32),
        file_size: xgdkit_common::types::number::U32Le::new(file_size as u32),
        attributes: attributes.bits(),
        name_length: node.name_bytes.len().min(u8::MAX as usize) as u8,
    }
}

/// Serializes the run of directory-entry events that share one table,
/// starting at `start`, into a sector-padded buffer. Gaps between entries
/// and the table's tail are `0xFF`. Returns the buffer and how many events
/// were consumed.
pub(crate) fn directory_to_buffer(
    tree: &AvlTree,
    events: &[WriteEvent],
    start: usize,
) -> (Vec<u8>, usize) {
    let mut buffer = Vec::new();
    let mut processed = 0;

    for event in &events[start..] {
        let node = tree.node(event.node);
        debug_assert!(event.directory_entry);
        debug_assert!(buffer.len() as u64 <= node.offset);
        buffer.resize(node.offset as usize, PAD_BYTE);

        let header = entry_header(tree, event.node);
        buffer.extend_from_slice(bytemuck::bytes_of(&header));
        buffer.extend_from_slice(&node.name_bytes[..header.name_length as usize]);
        processed += 1;

        let next = events.get(start + processed);
        let same_table = next.is_some_and(|n| {
            n.directory_entry && tree.node(n.node).directory_start == node.directory_start
        });
        if !same_table {
            break;
        }
    }

    let padded = (buffer.len() as u64).div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    buffer.resize(padded as usize, PAD_BYTE);
    (buffer, processed)
}

/// Numbered `.1`/`.2` part paths next to a base output path.
pub(crate) fn part_paths(base: &std::path::Path) -> (PathBuf, PathBuf) {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = base.parent().unwrap_or(std::path::Path::new(""));
    (
        parent.join(format!("{stem}.1{ext}")),
        parent.join(format!("{stem}.2{ext}")),
    )
}

/// Renames a single-part output back to its base name; a two-part output
/// keeps its numbered names.
pub(crate) fn resolve_out_paths(
    base: PathBuf,
    part_1: PathBuf,
    part_2: PathBuf,
) -> Result<Vec<PathBuf>> {
    if part_2.exists() {
        return Ok(vec![part_1, part_2]);
    }
    std::fs::rename(&part_1, &base).map_err(|source| Error::Rename {
        from: part_1,
        to: base.clone(),
        source,
    })?;
    Ok(vec![base])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avl::iter::write_events;

    #[test]
    fn directory_buffer_packs_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aa.bin"), b"1").unwrap();
        std::fs::write(dir.path().join("bb.bin"), b"2").unwrap();
        let tree = AvlTree::from_dir("t", dir.path()).unwrap();
        let events = write_events(&tree);
        let first_entry = events
            .iter()
            .position(|event| event.directory_entry)
            .unwrap();
        let (buffer, processed) = directory_to_buffer(&tree, &events, first_entry);

        assert_eq!(processed, 2);
        assert_eq!(buffer.len(), 2048);
        // Entry layout: 14-byte header, then the name.
        assert_eq!(&buffer[14..20], b"aa.bin");
        // Second entry starts on the next 4-byte boundary (14+6 -> 20).
        assert_eq!(&buffer[20 + 14..20 + 20], b"bb.bin");
        // Table tail is pad bytes.
        assert!(buffer[40..].iter().all(|&b| b == PAD_BYTE));
    }
}
