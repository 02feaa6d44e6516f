//! Flattens a planned tree into an offset-sorted stream of write events.
//!
//! Each node yields one event for its directory-table entry, and file nodes
//! yield a second event for their data. Writers walk the sorted array and
//! emit the image front to back, filling inter-event gaps with `0xFF` and
//! everything outside the events with zeros.

use super::{AvlTree, Kind, NodeId};
use crate::layout::SECTOR_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct WriteEvent {
    /// Absolute byte offset in the output image.
    pub offset: u64,
    /// True for a directory-table entry, false for file data.
    pub directory_entry: bool,
    pub node: NodeId,
}

/// All write events of the plan, sorted by output offset.
pub fn write_events(tree: &AvlTree) -> Vec<WriteEvent> {
    let mut events = Vec::new();
    // Skip the synthetic root: it has no directory entry of its own.
    for node in tree.collect(tree.root()).into_iter().skip(1) {
        if tree.node(node).kind == Kind::File {
            events.push(WriteEvent {
                offset: tree.node(node).start_sector * SECTOR_SIZE,
                directory_entry: false,
                node,
            });
        }
        events.push(WriteEvent {
            offset: tree.node(node).directory_start + tree.node(node).offset,
            directory_entry: true,
            node,
        });
    }
    events.sort_by_key(|event| event.offset);
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_sorted_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), vec![0u8; 100]).unwrap();
        let tree = AvlTree::from_dir("test", dir.path()).unwrap();
        let events = write_events(&tree);

        // Three nodes (a.bin, sub, b.bin), two of them files.
        assert_eq!(events.len(), 5);
        assert_eq!(
            events.iter().filter(|event| !event.directory_entry).count(),
            2
        );
        for pair in events.windows(2) {
            assert!(pair[0].offset <= pair[1].offset);
        }
        // The first event is an entry in the root table.
        assert_eq!(
            events[0].offset,
            crate::layout::ROOT_DIRECTORY_SECTOR as u64 * SECTOR_SIZE
        );
    }

    #[test]
    fn empty_root_has_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let tree = AvlTree::from_dir("test", dir.path()).unwrap();
        assert!(write_events(&tree).is_empty());
    }
}
