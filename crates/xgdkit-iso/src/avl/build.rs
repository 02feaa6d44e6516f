//! Tree construction from a host directory or from on-disc entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{AvlTree, Kind, Node, NodeId};
use crate::read::DirectoryEntry;
use crate::{Error, Result};

fn make_node(tree: &mut AvlTree, filename: &str) -> Result<NodeId> {
    let name_bytes = xgdkit_common::str::encode_entry_name(filename)
        .ok_or_else(|| Error::Encoding(filename.to_string()))?;
    Ok(tree.alloc(Node::new(filename.to_string(), name_bytes)))
}

/// Builds one directory's sibling tree from the host filesystem, recursing
/// into subdirectories. Entries are taken in name order so the planned image
/// does not depend on readdir ordering.
pub(super) fn from_filesystem(tree: &mut AvlTree, directory: &Path) -> Result<Option<NodeId>> {
    let mut dir_entries: Vec<std::fs::DirEntry> = std::fs::read_dir(directory)
        .map_err(|source| Error::FileOpen {
            path: directory.to_path_buf(),
            source,
        })?
        .collect::<std::io::Result<_>>()?;
    dir_entries.sort_by_key(|entry| entry.file_name());

    let mut subtree = None;
    for dir_entry in dir_entries {
        let entry_path = dir_entry.path();
        let filename = dir_entry.file_name().to_string_lossy().into_owned();
        let metadata = std::fs::metadata(&entry_path)?;

        let id = if metadata.is_dir() {
            let id = make_node(tree, &filename)?;
            let child_subtree = from_filesystem(tree, &entry_path)?;
            tree.node_mut(id).kind = match child_subtree {
                Some(sub) => Kind::Dir(sub),
                None => Kind::EmptyDir,
            };
            id
        } else if metadata.is_file() {
            if metadata.len() > u32::MAX as u64 {
                tracing::warn!(
                    path = %entry_path.display(),
                    size = metadata.len(),
                    "file exceeds the 4 GiB entry limit, skipping"
                );
                continue;
            }
            let id = make_node(tree, &filename)?;
            tree.node_mut(id).file_size = metadata.len();
            tree.total_bytes += metadata.len();
            tree.total_files += 1;
            id
        } else {
            continue;
        };

        tree.node_mut(id).path = std::path::absolute(&entry_path)?;
        let (new_root, _) = tree.insert_node(subtree, id)?;
        subtree = Some(new_root);
    }
    Ok(subtree)
}

/// Builds the forest from a flat, path-sorted list of on-disc entries.
pub(super) fn from_entries(
    tree: &mut AvlTree,
    entries: &[DirectoryEntry],
) -> Result<Option<NodeId>> {
    let mut children: HashMap<PathBuf, Vec<usize>> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let parent = entry
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        children.entry(parent).or_default().push(index);
    }
    build_directory(tree, entries, &children, Path::new(""))
}

fn build_directory(
    tree: &mut AvlTree,
    entries: &[DirectoryEntry],
    children: &HashMap<PathBuf, Vec<usize>>,
    directory: &Path,
) -> Result<Option<NodeId>> {
    let mut subtree = None;
    let Some(indices) = children.get(directory) else {
        return Ok(None);
    };

    for &index in indices {
        let entry = &entries[index];
        let id = if entry.header.is_directory() {
            let id = make_node(tree, &entry.filename)?;
            let child_subtree = build_directory(tree, entries, children, &entry.path)?;
            tree.node_mut(id).kind = match child_subtree {
                Some(sub) => Kind::Dir(sub),
                None => Kind::EmptyDir,
            };
            id
        } else {
            // Zero-length files from an existing image are not carried over.
            if entry.header.file_size.get() == 0 {
                continue;
            }
            let id = make_node(tree, &entry.filename)?;
            tree.total_bytes += entry.header.file_size.get() as u64;
            tree.total_files += 1;
            id
        };

        let node = tree.node_mut(id);
        node.file_size = if entry.header.is_directory() {
            0
        } else {
            entry.header.file_size.get() as u64
        };
        node.old_start_sector = entry.header.start_sector.get() as u64;
        node.path = entry.path.clone();

        let (new_root, _) = tree.insert_node(subtree, id)?;
        subtree = Some(new_root);
    }
    Ok(subtree)
}
