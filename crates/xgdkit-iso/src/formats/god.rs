//! GoD ("Games on Demand") container geometry and Live header offsets.
//!
//! Each Data part is one 0x1000-byte master hashtable block followed by
//! repeating groups of one sub-hashtable block and up to 204 data blocks,
//! with at most 203 sub-hashtables per part. A block holds two XISO sectors.

pub const BLOCK_SIZE: u64 = 0x1000;
pub const BLOCKS_PER_PART: u32 = 41616;
pub const DATA_BLOCKS_PER_SHT: u32 = 204;
pub const SHT_PER_MHT: u32 = 203;
pub const DATA_BLOCKS_PER_PART: u32 = DATA_BLOCKS_PER_SHT * SHT_PER_MHT;

pub const SHA1_LEN: usize = 20;

/// Offset within a master hashtable where the next part's master hash links.
pub const MASTER_LINK_OFFSET: u64 = (SHA1_LEN as u32 * SHT_PER_MHT) as u64;

pub const LIVE_HEADER_SIZE: usize = 0xB000;

/// Content-type words, big-endian in the Live header.
pub const CONTENT_GAMES_ON_DEMAND: u32 = 0x7000;
pub const CONTENT_ORIGINAL_XBOX: u32 = 0x5000;

/// Fixed patch offsets within the Live header.
pub mod live {
    /// SHA-1 over `[CONTENT_TYPE, end)`.
    pub const HEADER_HASH: usize = 0x32C;
    pub const CONTENT_TYPE: usize = 0x344;
    pub const MEDIA_ID: usize = 0x354;
    pub const TITLE_ID: usize = 0x360;
    pub const PLATFORM: usize = 0x364;
    pub const EXECUTABLE_TYPE: usize = 0x365;
    pub const DISC_NUMBER: usize = 0x366;
    pub const DISC_COUNT: usize = 0x367;
    pub const MASTER_HASH: usize = 0x37D;
    pub const PART_COUNT: usize = 0x3A0;
    pub const PARTS_SIZE: usize = 0x3A4;
    pub const TITLE_NAME_1: usize = 0x412;
    pub const TITLE_NAME_2: usize = 0x1692;
    pub const ICON_SIZE_1: usize = 0x1712;
    pub const ICON_SIZE_2: usize = 0x1716;
    pub const ICON_1: usize = 0x171A;
    pub const ICON_2: usize = 0x571A;

    /// Longest title stored at each name offset, in bytes of UTF-16LE.
    pub const TITLE_NAME_BYTES: usize = 80;
}

/// Where an XISO sector lands inside a set of Data parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remap {
    pub offset: u64,
    pub part: u32,
}

/// Maps an XISO sector to its part and byte offset, skipping hash blocks.
pub fn remap_sector(iso_sector: u64) -> Remap {
    let block = (iso_sector * crate::layout::SECTOR_SIZE) / BLOCK_SIZE;
    let part = (block / DATA_BLOCKS_PER_PART as u64) as u32;
    let block_in_part = block % DATA_BLOCKS_PER_PART as u64;
    let sht = block_in_part / DATA_BLOCKS_PER_SHT as u64;

    let mut offset = BLOCK_SIZE; // master hashtable
    offset += (sht + 1) * BLOCK_SIZE; // sub-hashtables passed so far
    offset += block_in_part * BLOCK_SIZE;
    offset += (iso_sector * crate::layout::SECTOR_SIZE) % BLOCK_SIZE;
    Remap { offset, part }
}

/// Maps an absolute XISO byte offset.
pub fn remap_offset(iso_offset: u64) -> Remap {
    let mut remap = remap_sector(iso_offset / crate::layout::SECTOR_SIZE);
    remap.offset += iso_offset % crate::layout::SECTOR_SIZE;
    remap
}

/// Whole 0x1000-byte blocks covering `bytes`.
pub fn num_blocks(bytes: u64) -> u32 {
    bytes.div_ceil(BLOCK_SIZE) as u32
}

/// Data parts needed for `data_blocks` blocks.
pub fn num_parts(data_blocks: u32) -> u32 {
    data_blocks.div_ceil(DATA_BLOCKS_PER_PART)
}
