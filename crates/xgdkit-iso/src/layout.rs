//! On-disc layout of the XISO filesystem.
//!
//! Everything here is bit-exact: the packed directory-entry header, the
//! volume header with its ECMA-119 stub, and the constants governing sector
//! arithmetic. All multi-byte fields are little-endian.

use bitflags::bitflags;
use static_assertions::assert_eq_size;
use xgdkit_common::time::FileTime;
use xgdkit_common::types::number::U16Le;
use xgdkit_common::types::number::U32Le;

pub const SECTOR_SIZE: u64 = 2048;
pub const PAD_BYTE: u8 = 0xFF;
pub const PAD_SHORT: u16 = 0xFFFF;
pub const FILE_MODULUS: u64 = 0x10000;

pub const REDUMP_VIDEO_SECTORS: u64 = 0x30600;
pub const REDUMP_TOTAL_SECTORS: u64 = 0x3A4D50;
pub const REDUMP_GAME_SECTORS: u64 = REDUMP_TOTAL_SECTORS - REDUMP_VIDEO_SECTORS;
pub const SPLIT_MARGIN: u64 = 0xFF00_0000;

pub const MAGIC_DATA: &[u8; 20] = b"MICROSOFT*XBOX*MEDIA";
pub const MAGIC_OFFSET: u64 = 0x10000;
pub const MAGIC_UNUSED_LEN: u64 = 0x7C8;

/// Byte offsets at which the filesystem may begin inside a physical image,
/// probed in this order.
pub const IMAGE_OFFSETS: [u64; 4] = [0, 0x0FD9_0000, 0x0208_0000, 0x1830_0000];

pub const ROOT_DIRECTORY_SECTOR: u32 = 0x108;

/// Identifies images produced by this tool; written at this header offset.
pub const AUTHOR_TAG: &[u8] = b"in!xgdt!0.3.1 (07.18.25)";
pub const AUTHOR_TAG_OFFSET: u64 = 31337;

/// Total bytes of the volume header region at the start of an image.
pub const HEADER_SIZE: u64 = MAGIC_OFFSET + SECTOR_SIZE;

const ECMA119_DATA_START: usize = 0x8000;
const ECMA119_VOL_SPACE_SIZE: usize = ECMA119_DATA_START + 80;
const ECMA119_VOL_SET_SIZE: usize = ECMA119_DATA_START + 120;
const ECMA119_VOL_SET_ID: usize = ECMA119_DATA_START + 190;
const ECMA119_VOL_CREATION_DATE: usize = ECMA119_DATA_START + 813;

bitflags! {
    /// Directory-entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const DIRECTORY = 0x10;
        const FILE      = 0x20;
        const NORMAL    = 0x80;
    }
}

/// The fixed 14-byte prefix of an on-disc directory entry.
///
/// The name bytes follow immediately, then `0xFF` padding up to the next
/// 4-byte boundary. `left_offset`/`right_offset` address sibling subtrees in
/// 32-bit words from the start of the directory table; `0xFFFF` means no
/// child.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirentHeader {
    pub left_offset: U16Le,
    pub right_offset: U16Le,
    pub start_sector: U32Le,
    pub file_size: U32Le,
    pub attributes: u8,
    pub name_length: u8,
}

assert_eq_size!(DirentHeader, [u8; 14]);

pub const DIRENT_HEADER_SIZE: u64 = core::mem::size_of::<DirentHeader>() as u64;

impl DirentHeader {
    pub fn is_directory(&self) -> bool {
        EntryAttributes::from_bits_retain(self.attributes).contains(EntryAttributes::DIRECTORY)
    }

    /// Serialized length of the header plus `name_len` name bytes, padded to
    /// the 4-byte entry alignment.
    pub fn entry_len(name_len: usize) -> u64 {
        let len = DIRENT_HEADER_SIZE + name_len as u64;
        (len + 3) & !3
    }
}

/// Rounds a byte count up to whole sectors.
pub fn num_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Builds the full volume header region for a new image.
///
/// The region consists of two zero-filled reserved stretches around a minimal
/// ECMA-119 primary volume descriptor (enough for DVD drives and PC tools to
/// identify the disc), the authoring tag, and the magic-delimited XISO root
/// record itself.
pub fn build_volume_header(
    root_sector: u32,
    root_size: u32,
    total_sectors: u32,
    file_time: FileTime,
) -> Vec<u8> {
    let mut header = vec![0u8; HEADER_SIZE as usize];

    header[AUTHOR_TAG_OFFSET as usize..AUTHOR_TAG_OFFSET as usize + AUTHOR_TAG.len()]
        .copy_from_slice(AUTHOR_TAG);

    // ECMA-119 primary volume descriptor.
    header[ECMA119_DATA_START..ECMA119_DATA_START + 7]
        .copy_from_slice(&[0x01, b'C', b'D', b'0', b'0', b'1', 0x01]);
    header[ECMA119_VOL_SPACE_SIZE..ECMA119_VOL_SPACE_SIZE + 4]
        .copy_from_slice(&total_sectors.to_le_bytes());
    header[ECMA119_VOL_SPACE_SIZE + 4..ECMA119_VOL_SPACE_SIZE + 8]
        .copy_from_slice(&total_sectors.to_be_bytes());
    header[ECMA119_VOL_SET_SIZE..ECMA119_VOL_SET_SIZE + 12].copy_from_slice(&[
        0x01, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x08, 0x08, 0x00,
    ]);
    header[ECMA119_VOL_SET_ID..ECMA119_VOL_CREATION_DATE].fill(0x20);
    let mut pos = ECMA119_VOL_CREATION_DATE;
    for _ in 0..4 {
        header[pos..pos + 16].copy_from_slice(b"0000000000000000");
        pos += 17;
    }
    header[pos] = 0x01;
    // Set-terminator descriptor in the following sector.
    let terminator = ECMA119_DATA_START + SECTOR_SIZE as usize;
    header[terminator..terminator + 7]
        .copy_from_slice(&[0xFF, b'C', b'D', b'0', b'0', b'1', 0x01]);

    // XISO root record, bracketed by the magic string.
    let mut pos = MAGIC_OFFSET as usize;
    header[pos..pos + MAGIC_DATA.len()].copy_from_slice(MAGIC_DATA);
    pos += MAGIC_DATA.len();
    header[pos..pos + 4].copy_from_slice(&root_sector.to_le_bytes());
    pos += 4;
    header[pos..pos + 4].copy_from_slice(&root_size.to_le_bytes());
    pos += 4;
    header[pos..pos + 8].copy_from_slice(bytemuck::bytes_of(&file_time));
    pos += 8 + MAGIC_UNUSED_LEN as usize;
    header[pos..pos + MAGIC_DATA.len()].copy_from_slice(MAGIC_DATA);
    debug_assert_eq!(pos + MAGIC_DATA.len(), HEADER_SIZE as usize);

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_len_pads_to_four() {
        assert_eq!(DirentHeader::entry_len(1), 16);
        assert_eq!(DirentHeader::entry_len(2), 16);
        assert_eq!(DirentHeader::entry_len(6), 20);
        assert_eq!(DirentHeader::entry_len(10), 24);
    }

    #[test]
    fn volume_header_layout() {
        let header = build_volume_header(0x108, 2048, 0x1000, FileTime::default());
        assert_eq!(header.len(), 0x10800);
        assert_eq!(&header[0x10000..0x10014], MAGIC_DATA);
        assert_eq!(&header[0x107EC..0x10800], MAGIC_DATA);
        assert_eq!(&header[0x10014..0x10018], &0x108u32.to_le_bytes());
        assert_eq!(&header[0x10018..0x1001C], &2048u32.to_le_bytes());
        // ECMA-119 identifier and both-endian volume space size.
        assert_eq!(&header[0x8001..0x8006], b"CD001");
        assert_eq!(&header[0x8050..0x8054], &0x1000u32.to_le_bytes());
        assert_eq!(&header[0x8054..0x8058], &0x1000u32.to_be_bytes());
        assert_eq!(&header[0x8800..0x8806], &[0xFF, b'C', b'D', b'0', b'0', b'1']);
        // Authoring tag.
        assert_eq!(&header[31337..31337 + 8], b"in!xgdt!");
    }

    #[test]
    fn num_sectors_rounds_up() {
        assert_eq!(num_sectors(0), 0);
        assert_eq!(num_sectors(1), 1);
        assert_eq!(num_sectors(2048), 1);
        assert_eq!(num_sectors(2049), 2);
    }
}
