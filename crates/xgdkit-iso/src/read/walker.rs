//! Iterative walks over the on-disc directory tree.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use super::{DirectoryEntry, Source};
use crate::layout::{
    DirentHeader, DIRENT_HEADER_SIZE, MAGIC_OFFSET, REDUMP_GAME_SECTORS, REDUMP_TOTAL_SECTORS,
    SECTOR_SIZE,
};
use crate::{Error, Result};

/// A directory table queued for visiting, with the word offset of the next
/// entry to read inside it.
struct Frame {
    position: u64,
    offset: u64,
    table_size: u32,
    path: PathBuf,
}

fn root_frame(source: &mut Source) -> Result<Frame> {
    let mut root = [0u8; 8];
    source.read_bytes(source.image_offset() + MAGIC_OFFSET + 20, &mut root)?;
    let root_sector = u32::from_le_bytes(root[0..4].try_into().unwrap());
    let root_size = u32::from_le_bytes(root[4..8].try_into().unwrap());
    Ok(Frame {
        position: root_sector as u64 * SECTOR_SIZE,
        offset: 0,
        table_size: root_size,
        path: PathBuf::new(),
    })
}

fn read_entry(source: &mut Source, position: u64) -> Result<(DirentHeader, Vec<u8>)> {
    let mut header_bytes = [0u8; DIRENT_HEADER_SIZE as usize];
    source.read_bytes(position, &mut header_bytes)?;
    let header: DirentHeader = bytemuck::pod_read_unaligned(&header_bytes);
    let mut name_bytes = vec![0u8; header.name_length as usize];
    source.read_bytes(position + DIRENT_HEADER_SIZE, &mut name_bytes)?;
    Ok((header, name_bytes))
}

/// Whether a sibling offset ends the branch. `0xFFFF` is the regular
/// terminator; a bare `0xFF` appears in some malformed images and is treated
/// the same.
fn is_terminator(offset: u16) -> bool {
    offset == 0xFFFF || offset == 0xFF
}

pub(super) fn directory_entries(source: &mut Source) -> Result<Vec<DirectoryEntry>> {
    let (mut entries, _) = walk(source, false)?;
    entries.sort_by(|a, b| {
        b.header
            .is_directory()
            .cmp(&a.header.is_directory())
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(entries)
}

pub(super) fn executable_entry(source: &mut Source) -> Result<DirectoryEntry> {
    let (_, executable) = walk(source, true)?;
    executable.ok_or_else(|| Error::Other("no boot executable found in image".into()))
}

fn walk(
    source: &mut Source,
    exe_only: bool,
) -> Result<(Vec<DirectoryEntry>, Option<DirectoryEntry>)> {
    let image_offset = source.image_offset();
    let mut entries = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(root_frame(source)?);

    while let Some(mut frame) = queue.pop_front() {
        if frame.offset * 4 >= frame.table_size as u64 {
            continue;
        }
        let position = image_offset + frame.position + frame.offset * 4;
        let (header, name_bytes) = read_entry(source, position)?;
        let filename = xgdkit_common::str::decode_entry_name_lossy(&name_bytes);

        if is_terminator(header.left_offset.get()) {
            continue;
        }
        if header.left_offset.get() != 0 {
            queue.push_back(Frame {
                offset: header.left_offset.get() as u64,
                position: frame.position,
                table_size: frame.table_size,
                path: frame.path.clone(),
            });
        }

        if exe_only {
            if !header.is_directory() && header.file_size.get() > 0 {
                let lower = filename.to_lowercase();
                if lower.contains("default.xex") || lower.contains("default.xbe") {
                    let entry = DirectoryEntry {
                        header,
                        path: PathBuf::from(&filename),
                        filename,
                        name_bytes,
                        position: frame.position,
                        offset: frame.offset,
                    };
                    return Ok((entries, Some(entry)));
                }
            }
        } else if header.is_directory() {
            let entry = DirectoryEntry {
                header,
                path: frame.path.join(&filename),
                filename,
                name_bytes,
                position: header.start_sector.get() as u64 * SECTOR_SIZE,
                offset: 0,
            };
            if header.file_size.get() > 0 {
                queue.push_back(Frame {
                    position: entry.position,
                    offset: 0,
                    table_size: header.file_size.get(),
                    path: entry.path.clone(),
                });
            }
            entries.push(entry);
        } else if header.file_size.get() > 0 {
            entries.push(DirectoryEntry {
                header,
                path: frame.path.join(&filename),
                filename,
                name_bytes,
                position,
                offset: frame.offset,
            });
        }

        if !is_terminator(header.right_offset.get()) && header.right_offset.get() != 0 {
            frame.offset = header.right_offset.get() as u64;
            queue.push_back(frame);
        }
    }

    Ok((entries, None))
}

/// The union of directory-table sectors and file-data sectors.
pub(super) fn data_sectors(source: &mut Source) -> Result<HashSet<u32>> {
    let image_offset = source.image_offset();
    let sector_offset = (image_offset / SECTOR_SIZE) as u32;
    let mut sectors = HashSet::new();

    let header_sector = sector_offset + (MAGIC_OFFSET / SECTOR_SIZE) as u32;
    sectors.insert(header_sector);
    sectors.insert(header_sector + 1);

    let mut queue = VecDeque::new();
    queue.push_back(root_frame(source)?);

    tracing::debug!("collecting data sectors");
    while let Some(mut frame) = queue.pop_front() {
        let consumed = frame.offset * 4;
        if consumed >= frame.table_size as u64 {
            continue;
        }
        let position = image_offset + frame.position + consumed;

        // The rest of this table, from the current entry onward.
        let first = position / SECTOR_SIZE;
        let count = (frame.table_size as u64 - consumed).div_ceil(SECTOR_SIZE);
        sectors.extend((first..first + count).map(|s| s as u32));

        let (header, _) = read_entry(source, position)?;
        if is_terminator(header.left_offset.get()) {
            continue;
        }
        if header.left_offset.get() != 0 {
            queue.push_back(Frame {
                offset: header.left_offset.get() as u64,
                position: frame.position,
                table_size: frame.table_size,
                path: PathBuf::new(),
            });
        }

        if header.is_directory() {
            if header.file_size.get() > 0 {
                queue.push_back(Frame {
                    position: header.start_sector.get() as u64 * SECTOR_SIZE,
                    offset: 0,
                    table_size: header.file_size.get(),
                    path: PathBuf::new(),
                });
            }
        } else if header.file_size.get() > 0 {
            let first = sector_offset + header.start_sector.get();
            let count = (header.file_size.get() as u64).div_ceil(SECTOR_SIZE) as u32;
            sectors.extend(first..first + count);
        }

        if !is_terminator(header.right_offset.get()) && header.right_offset.get() != 0 {
            frame.offset = header.right_offset.get() as u64;
            queue.push_back(frame);
        }
    }
    Ok(sectors)
}

/// Scans a Redump-sized OG Xbox image for its security sector runs: stretches
/// of exactly 0x1000 all-zero sectors outside the data set. Returns `None`
/// when the image is not Redump-sized, leaving the caller to assume a
/// compact image.
pub(super) fn security_sectors(
    source: &mut Source,
    data_sectors: &HashSet<u32>,
) -> Result<Option<HashSet<u32>>> {
    let total = source.total_sectors() as u64;
    if total != REDUMP_GAME_SECTORS && total != REDUMP_TOTAL_SECTORS {
        return Ok(None);
    }

    const END_SECTOR: u32 = 0x345B60;
    let sector_offset = (source.image_offset() / SECTOR_SIZE) as u32;
    let mut security = HashSet::new();
    let mut run_start = 0u32;
    let mut in_run = false;
    let mut buffer = vec![0u8; SECTOR_SIZE as usize];

    tracing::debug!("scanning for security sectors");
    for index in 0..=END_SECTOR {
        let current = sector_offset + index;
        source.read_sector(current, &mut buffer)?;

        let is_data = data_sectors.contains(&current);
        let is_empty = buffer.iter().all(|&b| b == 0);

        if is_empty && !in_run && !is_data {
            run_start = current;
            in_run = true;
        } else if !is_empty && in_run {
            let run_end = current - 1;
            in_run = false;
            if run_end - run_start == 0xFFF {
                security.extend(run_start..=run_end);
            }
        }
    }
    Ok(Some(security))
}
