//! CSO container: per-sector LZ4 frame compression with an inline index.
//!
//! The index (one u32 per sector plus a terminator) follows the header
//! directly. A compressed record is the block section of an LZ4 frame (a
//! little-endian length word followed by the block data) with the 7-byte
//! frame header and 4-byte end mark stripped; readers reconstitute them
//! before decoding. A stored record is exactly [`BLOCK_SIZE`] raw bytes.

use static_assertions::assert_eq_size;
use xgdkit_common::types::number::{U16Le, U32Le, U64Le};

pub const MAGIC: [u8; 4] = *b"CISO";
pub const HEADER_SIZE: u32 = 24;
pub const BLOCK_SIZE: u32 = 2048;
pub const VERSION: u8 = 2;
pub const INDEX_ALIGNMENT: u8 = 2;
pub const SPLIT_OFFSET: u64 = 0xFFBF_6000;

/// Trailing pad modulus of a finished part file.
pub const FILE_MODULUS: u64 = 0x400;

/// Index bit marking a compressed record.
pub const INDEX_COMPRESSED: u32 = 0x8000_0000;

/// The fixed LZ4 frame header matching the writer's parameters
/// (64 KiB independent blocks, no checksums), re-attached when decoding.
pub const LZ4F_HEADER: [u8; 7] = [0x04, 0x22, 0x4D, 0x18, 0x60, 0x40, 0x82];

/// Frame end mark, re-attached when decoding.
pub const LZ4F_FOOTER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Within a frame block section, the high length bit means the block is
/// stored rather than compressed.
pub const FRAME_BLOCK_UNCOMPRESSED: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Header {
    pub magic: [u8; 4],
    pub header_size: U32Le,
    pub uncompressed_size: U64Le,
    pub block_size: U32Le,
    pub version: u8,
    pub index_alignment: u8,
    pub reserved: U16Le,
}

assert_eq_size!(Header, [u8; 24]);

impl Header {
    pub fn new(uncompressed_size: u64) -> Self {
        Self {
            magic: MAGIC,
            header_size: U32Le::new(HEADER_SIZE),
            uncompressed_size: U64Le::new(uncompressed_size),
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
        let header = Header::new(0x4_0000);
        let bytes = bytemuck::bytes_of(&header).to_vec();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], b"CISO");
        let parsed: Header = bytemuck::pod_read_unaligned(&bytes);
        assert!(parsed.validate());
        assert_eq!(parsed.uncompressed_size.get(), 0x4_0000);
    }
}
