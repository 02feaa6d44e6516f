//! CCI container: per-sector LZ4 block compression with a packed index.
//!
//! Each compressed record starts with a one-byte padding length chosen so
//! that the record as a whole ends on a `1 << INDEX_ALIGNMENT`-byte boundary.
//! The index (one u32 per sector plus a terminator) lives at `index_offset`:
//! bits 30:0 hold the record's file offset shifted right by
//! `INDEX_ALIGNMENT`, bit 31 marks a compressed record.

use static_assertions::assert_eq_size;
use xgdkit_common::types::number::{U16Le, U32Le, U64Le};

pub const MAGIC: [u8; 4] = *b"CCIM";
pub const HEADER_SIZE: u32 = 32;
pub const BLOCK_SIZE: u32 = 2048;
pub const VERSION: u8 = 1;
pub const INDEX_ALIGNMENT: u8 = 2;
pub const SPLIT_OFFSET: u64 = 0xFF00_0000;

/// Index bit marking a compressed record.
pub const INDEX_COMPRESSED: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Header {
    pub magic: [u8; 4],
    pub header_size: U32Le,
    pub uncompressed_size: U64Le,
    pub index_offset: U64Le,
    pub block_size: U32Le,
    pub version: u8,
    pub index_alignment: u8,
    pub reserved: U16Le,
}

assert_eq_size!(Header, [u8; 32]);

impl Header {
    pub fn new(uncompressed_size: u64, index_offset: u64) -> Self {
        Self {
            magic: MAGIC,
            header_size: U32Le::new(HEADER_SIZE),
            uncompressed_size: U64Le::new(uncompressed_size),
            index_offset: U64Le::new(index_offset),
            block_size: U32Le::new(BLOCK_SIZE),
            version: VERSION,
            index_alignment: INDEX_ALIGNMENT,
            reserved: U16Le::new(0),
        }
    }

    pub fn validate(&self) -> bool {
        self.magic == MAGIC
            && self.header_size.get() == HEADER_SIZE
            && self.block_size.get() == BLOCK_SIZE
            && self.version == VERSION
            && self.index_alignment == INDEX_ALIGNMENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = Header::new(0x123000, 0x8000);
        let bytes = bytemuck::bytes_of(&header).to_vec();
        assert_eq!(&bytes[0..4], b"CCIM");
        let parsed: Header = bytemuck::pod_read_unaligned(&bytes);
        assert!(parsed.validate());
        assert_eq!(parsed.uncompressed_size.get(), 0x123000);
        assert_eq!(parsed.index_offset.get(), 0x8000);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut header = Header::new(0, 0);
        header.magic = *b"XXXX";
        assert!(!header.validate());
    }
}
