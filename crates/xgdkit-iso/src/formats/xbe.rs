//! Original-Xbox executable (XBE) header and certificate.
//!
//! Only the fields the transcoder needs are interpreted: the magic, the
//! base/certificate addresses used to locate the certificate, and the
//! certificate's identity and allowed-media fields. All values are
//! little-endian.

use bitflags::bitflags;
use static_assertions::assert_eq_size;
use xgdkit_common::types::number::{U16Le, U32Le};

pub const MAGIC: [u8; 4] = *b"XBEH";

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Header {
    pub magic: [u8; 4],
    pub signature: [u8; 256],
    pub base_address: U32Le,
    pub total_header_size: U32Le,
    pub image_size: U32Le,
    pub image_header_size: U32Le,
    pub timestamp: U32Le,
    pub cert_address: U32Le,
    pub section_count: U32Le,
    pub section_headers_address: U32Le,
    pub init_flags: U32Le,
    pub entry_point: U32Le,
    pub tls_address: U32Le,
    pub pe_stack_commit: U32Le,
    pub pe_heap_reserve: U32Le,
    pub pe_heap_commit: U32Le,
    pub pe_base_address: U32Le,
    pub pe_size_of_image: U32Le,
    pub pe_checksum: U32Le,
    pub pe_timestamp: U32Le,
    pub debug_pathname_address: U32Le,
    pub debug_filename_address: U32Le,
    pub debug_filename_w_address: U32Le,
    pub kernel_thunk_address: U32Le,
    pub nonkernel_import_dir_address: U32Le,
    pub library_version_count: U32Le,
    pub library_version_address: U32Le,
    pub kernel_library_version_address: U32Le,
    pub xapi_library_version_address: U32Le,
    pub logo_bitmap_address: U32Le,
    pub logo_bitmap_size: U32Le,
}

assert_eq_size!(Header, [u8; 0x178]);

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Cert {
    pub size: U32Le,
    pub timestamp: U32Le,
    pub title_id: U32Le,
    /// UTF-16LE, space for 40 code units.
    pub title_name: [U16Le; 40],
    pub alt_title_ids: [U32Le; 16],
    pub allowed_media_types: U32Le,
    pub region_code: U32Le,
    pub ratings: U32Le,
    pub disc_number: U32Le,
    pub cert_version: U32Le,
    pub lan_key: [u8; 16],
    pub signature_key: [u8; 16],
    pub alt_signature_keys: [[u8; 16]; 16],
}

assert_eq_size!(Cert, [u8; 0x1D0]);

/// Byte offset of `allowed_media_types` within the certificate.
pub const CERT_ALLOWED_MEDIA_OFFSET: u64 = 0x9C;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllowedMedia: u32 {
        const HARD_DISK           = 0x0000_0001;
        const XGD1                = 0x0000_0002;
        const DVD_CD              = 0x0000_0004;
        const CD                  = 0x0000_0008;
        const DVD_5_RO            = 0x0000_0010;
        const DVD_9_RO            = 0x0000_0020;
        const DVD_5_RW            = 0x0000_0040;
        const DVD_9_RW            = 0x0000_0080;
        const DONGLE              = 0x0000_0100;
        const MEDIA_BOARD         = 0x0000_0200;
        const NONSECURE_HARD_DISK = 0x4000_0000;
        const NONSECURE_MODE      = 0x8000_0000;
    }
}
