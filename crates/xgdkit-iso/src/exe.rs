//! Locating and reading XBE/XEX certificates.
//!
//! The transcoder needs just enough of the boot executable to name outputs
//! and fill the GoD Live header: the XBE certificate, or the XEX execution
//! info record. An XBE-sourced image gets a synthesized execution info so
//! downstream code handles both consoles uniformly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytemuck::Zeroable;
use xgdkit_common::types::number::U32Be;

use crate::formats::{xbe, xex};
use crate::layout::SECTOR_SIZE;
use crate::read::ImageReader;
use crate::{Error, Platform, Result};

/// Policy for rewriting an XBE's allowed-media field so a disc rip boots
/// from hard disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPatch {
    /// OR in `HARD_DISK | NONSECURE_HARD_DISK`, keeping the original bits.
    Extend,
    /// Replace the field with every media type allowed.
    ReplaceAll,
}

pub struct ExeTool {
    platform: Platform,
    xex_cert: xex::ExecutionInfo,
    xbe_cert: Option<Box<xbe::Cert>>,
    title_id: u32,
    exe_offset: u64,
    cert_offset: u64,
}

enum ExeSource<'a> {
    File(File),
    Reader {
        reader: &'a mut ImageReader,
        exe_offset: u64,
    },
}

impl ExeSource<'_> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            ExeSource::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
                Ok(())
            }
            ExeSource::Reader { reader, exe_offset } => {
                reader.read_bytes(*exe_offset + offset, buf)
            }
        }
    }
}

impl ExeTool {
    /// Reads the certificate from an executable on the host filesystem,
    /// deciding the console by file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let file = File::open(path).map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut source = ExeSource::File(file);
        if name.ends_with(".xex") {
            Self::parse_xex(&mut source, 0)
        } else if name.ends_with(".xbe") {
            Self::parse_xbe(&mut source, 0)
        } else {
            Err(Error::Other(format!("not an executable: {name}")))
        }
    }

    /// Reads the certificate of the image's boot executable.
    pub fn from_reader(reader: &mut ImageReader) -> Result<Self> {
        let platform = reader.platform()?;
        let entry = reader.executable_entry()?.clone();
        let exe_offset =
            entry.header.start_sector.get() as u64 * SECTOR_SIZE + reader.image_offset();
        let mut source = ExeSource::Reader { reader, exe_offset };
        match platform {
            Platform::X360 => Self::parse_xex(&mut source, exe_offset),
            Platform::Ogx => Self::parse_xbe(&mut source, exe_offset),
        }
    }

    fn parse_xbe(source: &mut ExeSource, exe_offset: u64) -> Result<Self> {
        let mut header_bytes = [0u8; core::mem::size_of::<xbe::Header>()];
        source.read_at(0, &mut header_bytes)?;
        let header: xbe::Header = bytemuck::pod_read_unaligned(&header_bytes);
        if header.magic != xbe::MAGIC {
            return Err(Error::InvalidXbe("bad header magic".into()));
        }

        let cert_offset = header
            .cert_address
            .get()
            .checked_sub(header.base_address.get())
            .ok_or_else(|| Error::InvalidXbe("certificate before image base".into()))?
            as u64;
        let mut cert_bytes = [0u8; core::mem::size_of::<xbe::Cert>()];
        source.read_at(cert_offset, &mut cert_bytes)?;
        let cert: xbe::Cert = bytemuck::pod_read_unaligned(&cert_bytes);
        let title_id = cert.title_id.get();

        // Synthesize the 360-shaped record the GoD header wants.
        let mut xex_cert = xex::ExecutionInfo::zeroed();
        xex_cert.title_id = U32Be::new(title_id);
        xex_cert.disc_number = 1;
        xex_cert.disc_count = 1;

        Ok(Self {
            platform: Platform::Ogx,
            xex_cert,
            xbe_cert: Some(Box::new(cert)),
            title_id,
            exe_offset,
            cert_offset,
        })
    }

    fn parse_xex(source: &mut ExeSource, exe_offset: u64) -> Result<Self> {
        let mut header_bytes = [0u8; core::mem::size_of::<xex::Header>()];
        source.read_at(0, &mut header_bytes)?;
        let header: xex::Header = bytemuck::pod_read_unaligned(&header_bytes);
        if header.magic != xex::MAGIC {
            return Err(Error::InvalidXex("bad header magic".into()));
        }

        let mut entry_bytes = [0u8; core::mem::size_of::<xex::DirectoryEntry>()];
        for i in 0..header.header_count.get() as u64 {
            source.read_at(
                core::mem::size_of::<xex::Header>() as u64 + i * 8,
                &mut entry_bytes,
            )?;
            let entry: xex::DirectoryEntry = bytemuck::pod_read_unaligned(&entry_bytes);
            if entry.key.get() == xex::KEY_EXECUTION_INFO {
                let mut info_bytes = [0u8; core::mem::size_of::<xex::ExecutionInfo>()];
                source.read_at(entry.value.get() as u64, &mut info_bytes)?;
                let xex_cert: xex::ExecutionInfo = bytemuck::pod_read_unaligned(&info_bytes);
                return Ok(Self {
                    platform: Platform::X360,
                    title_id: xex_cert.title_id.get(),
                    xex_cert,
                    xbe_cert: None,
                    exe_offset,
                    cert_offset: entry.value.get() as u64,
                });
            }
        }
        Err(Error::InvalidXex("no execution info record".into()))
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The execution info record; synthesized from the certificate for XBE
    /// inputs.
    pub fn xex_cert(&self) -> &xex::ExecutionInfo {
        &self.xex_cert
    }

    /// The XBE certificate, when the executable is an XBE.
    pub fn xbe_cert(&self) -> Option<&xbe::Cert> {
        self.xbe_cert.as_deref()
    }

    /// The title id in host byte order, whichever console it came from.
    pub fn title_id(&self) -> u32 {
        self.title_id
    }

    /// Absolute byte offset of the executable within the image (zero when
    /// read from a host file).
    pub fn exe_offset(&self) -> u64 {
        self.exe_offset
    }

    /// Byte offset of the certificate relative to the executable.
    pub fn cert_offset(&self) -> u64 {
        self.cert_offset
    }
}

pub fn apply_media_patch(allowed_media: u32, patch: MediaPatch) -> u32 {
    match patch {
        MediaPatch::Extend => {
            allowed_media
                | (xbe::AllowedMedia::HARD_DISK | xbe::AllowedMedia::NONSECURE_HARD_DISK).bits()
        }
        MediaPatch::ReplaceAll => xbe::AllowedMedia::all().bits(),
    }
}

/// Patches the allowed-media field of an XBE on the host filesystem.
pub fn patch_xbe_file(path: &Path, patch: MediaPatch) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;

    let mut header_bytes = [0u8; core::mem::size_of::<xbe::Header>()];
    file.read_exact(&mut header_bytes)?;
    let header: xbe::Header = bytemuck::pod_read_unaligned(&header_bytes);
    if header.magic != xbe::MAGIC {
        return Err(Error::InvalidXbe("bad header magic".into()));
    }

    let field_offset = header
        .cert_address
        .get()
        .checked_sub(header.base_address.get())
        .ok_or_else(|| Error::InvalidXbe("certificate before image base".into()))?
        as u64
        + xbe::CERT_ALLOWED_MEDIA_OFFSET;
    let mut field = [0u8; 4];
    file.seek(SeekFrom::Start(field_offset))?;
    file.read_exact(&mut field)?;
    let patched = apply_media_patch(u32::from_le_bytes(field), patch);
    file.seek(SeekFrom::Start(field_offset))?;
    file.write_all(&patched.to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_xbe() -> Vec<u8> {
        let mut image = vec![0u8; 0x2000];
        let mut header = xbe::Header::zeroed();
        header.magic = xbe::MAGIC;
        header.base_address = xgdkit_common::types::number::U32Le::new(0x0001_0000);
        header.cert_address = xgdkit_common::types::number::U32Le::new(0x0001_1000);
        image[..core::mem::size_of::<xbe::Header>()]
            .copy_from_slice(bytemuck::bytes_of(&header));

        let mut cert = xbe::Cert::zeroed();
        cert.title_id = xgdkit_common::types::number::U32Le::new(0x4D53_0004);
        cert.allowed_media_types = xgdkit_common::types::number::U32Le::new(0x0000_0002);
        cert.region_code = xgdkit_common::types::number::U32Le::new(1);
        image[0x1000..0x1000 + core::mem::size_of::<xbe::Cert>()]
            .copy_from_slice(bytemuck::bytes_of(&cert));
        image
    }

    #[test]
    fn parses_xbe_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.xbe");
        std::fs::write(&path, fake_xbe()).unwrap();

        let tool = ExeTool::from_path(&path).unwrap();
        assert_eq!(tool.platform(), Platform::Ogx);
        assert_eq!(tool.title_id(), 0x4D53_0004);
        assert_eq!(tool.cert_offset(), 0x1000);
        // The synthesized record stores the id big-endian with disc 1 of 1.
        assert_eq!(tool.xex_cert().title_id.get(), 0x4D53_0004);
        assert_eq!(tool.xex_cert().disc_number, 1);
        assert_eq!(tool.xex_cert().disc_count, 1);
    }

    #[test]
    fn parses_xex_execution_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.xex");
        let mut image = vec![0u8; 0x400];
        let mut header = xex::Header::zeroed();
        header.magic = xex::MAGIC;
        header.header_count = U32Be::new(2);
        image[..0x18].copy_from_slice(bytemuck::bytes_of(&header));
        // First entry is unrelated, second is the execution info.
        image[0x18..0x1C].copy_from_slice(&0x0001_0100u32.to_be_bytes());
        image[0x1C..0x20].copy_from_slice(&0u32.to_be_bytes());
        image[0x20..0x24].copy_from_slice(&xex::KEY_EXECUTION_INFO.to_be_bytes());
        image[0x24..0x28].copy_from_slice(&0x200u32.to_be_bytes());
        let mut info = xex::ExecutionInfo::zeroed();
        info.media_id = U32Be::new(0x1234_5678);
        info.title_id = U32Be::new(0x4156_004F);
        info.disc_number = 1;
        info.disc_count = 2;
        image[0x200..0x218].copy_from_slice(bytemuck::bytes_of(&info));
        std::fs::write(&path, image).unwrap();

        let tool = ExeTool::from_path(&path).unwrap();
        assert_eq!(tool.platform(), Platform::X360);
        assert_eq!(tool.title_id(), 0x4156_004F);
        assert_eq!(tool.xex_cert().media_id.get(), 0x1234_5678);
        assert_eq!(tool.xex_cert().disc_count, 2);
    }

    #[test]
    fn media_patch_policies() {
        let extended = apply_media_patch(0x2, MediaPatch::Extend);
        assert_eq!(extended, 0x4000_0003);
        let replaced = apply_media_patch(0x2, MediaPatch::ReplaceAll);
        assert_eq!(replaced, xbe::AllowedMedia::all().bits());
    }

    #[test]
    fn patches_allowed_media_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.xbe");
        std::fs::write(&path, fake_xbe()).unwrap();

        patch_xbe_file(&path, MediaPatch::Extend).unwrap();
        let image = std::fs::read(&path).unwrap();
        let field = u32::from_le_bytes(image[0x109C..0x10A0].try_into().unwrap());
        assert_eq!(field, 0x4000_0003);
    }
}
