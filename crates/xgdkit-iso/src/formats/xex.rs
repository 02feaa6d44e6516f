//! Xbox 360 executable (XEX2) header and execution info.
//!
//! XEX fields are big-endian on disc. The optional-header directory after
//! the fixed header is scanned for the `EXECUTION_INFO` key, whose value is
//! the file offset of the 24-byte [`ExecutionInfo`] record.

use static_assertions::assert_eq_size;
use xgdkit_common::types::number::U32Be;

pub const MAGIC: [u8; 4] = *b"XEX2";

/// Optional-header key of the execution info record.
pub const KEY_EXECUTION_INFO: u32 = 0x0004_0006;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Header {
    pub magic: [u8; 4],
    pub module_flags: U32Be,
    pub sizeof_headers: U32Be,
    pub sizeof_discardable_headers: U32Be,
    pub security_info: U32Be,
    pub header_count: U32Be,
}

assert_eq_size!(Header, [u8; 0x18]);

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirectoryEntry {
    pub key: U32Be,
    pub value: U32Be,
}

assert_eq_size!(DirectoryEntry, [u8; 8]);

/// Identity record used for naming and the GoD Live header. Multi-byte
/// fields keep their on-disc big-endian order so they can be copied into
/// the Live header verbatim.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ExecutionInfo {
    pub media_id: U32Be,
    pub version: U32Be,
    pub base_version: U32Be,
    pub title_id: U32Be,
    pub platform: u8,
    pub executable_type: u8,
    pub disc_number: u8,
    pub disc_count: u8,
    pub savegame_id: U32Be,
}

assert_eq_size!(ExecutionInfo, [u8; 24]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_info_parses_big_endian() {
        let mut bytes = [0u8; 24];
        bytes[12..16].copy_from_slice(&[0x41, 0x56, 0x00, 0x4F]); // title id
        bytes[18] = 1; // disc number
        bytes[19] = 2; // disc count
        let info: ExecutionInfo = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(info.title_id.get(), 0x4156_004F);
        assert_eq!(info.disc_number, 1);
        assert_eq!(info.disc_count, 2);
    }
}
