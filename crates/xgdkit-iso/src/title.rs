//! Output naming from the title's identity.
//!
//! Every produced file and folder is named after the game. The name comes
//! from a pluggable [`TitleProvider`] (an online title database, a local
//! list) when one is supplied and knows the title, and otherwise from the
//! input's own file name, cleaned of dump-style qualifiers.

use std::path::Path;

use sha1::{Digest, Sha1};

use crate::exe::ExeTool;
use crate::formats::{xbe, xex};
use crate::read::ImageReader;
use crate::{Error, Platform, Result};

/// Per-target name length limits.
const ISO_NAME_LIMIT: usize = 36;
const FOLDER_NAME_LIMIT: usize = 42;
const GOD_FOLDER_NAME_LIMIT: usize = 31;
const TITLE_NAME_UNITS: usize = 40;

/// Title metadata resolved by an external database.
#[derive(Debug, Clone, Default)]
pub struct TitleInfo {
    pub title_name: String,
    pub iso_name: Option<String>,
    pub folder_name: Option<String>,
    pub icon: Option<Vec<u8>>,
}

/// External title lookup. Implementations may consult an online database;
/// the core itself never goes online.
pub trait TitleProvider {
    fn lookup(&self, platform: Platform, title_id: u32) -> Option<TitleInfo>;
}

pub struct TitleHelper {
    platform: Platform,
    title_id: u32,
    xex_cert: xex::ExecutionInfo,
    xbe_cert: Option<Box<xbe::Cert>>,
    title_name: String,
    iso_name: String,
    folder_name: String,
    god_folder_name: String,
    unique_name: String,
    utf16_title: Vec<u16>,
    icon: Vec<u8>,
}

impl TitleHelper {
    pub fn from_reader(
        reader: &mut ImageReader,
        provider: Option<&dyn TitleProvider>,
    ) -> Result<Self> {
        let fallback = reader.name().to_string();
        let exe = ExeTool::from_reader(reader)?;
        Ok(Self::build(exe, &fallback, provider))
    }

    /// Finds the boot executable at the top of an extracted directory.
    pub fn from_dir(directory: &Path, provider: Option<&dyn TitleProvider>) -> Result<Self> {
        let mut exe = None;
        for entry in std::fs::read_dir(directory).map_err(|source| Error::FileOpen {
            path: directory.to_path_buf(),
            source,
        })? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if entry.file_type()?.is_file()
                && (name.contains("default.xex") || name.contains("default.xbe"))
            {
                exe = Some(ExeTool::from_path(&entry.path())?);
                break;
            }
        }
        let exe = exe.ok_or_else(|| {
            Error::Missing(directory.join("default.xbe / default.xex"))
        })?;
        let fallback = directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::build(exe, &fallback, provider))
    }

    fn build(exe: ExeTool, fallback_name: &str, provider: Option<&dyn TitleProvider>) -> Self {
        let looked_up = provider.and_then(|p| p.lookup(exe.platform(), exe.title_id()));

        let (title_name, iso_name, folder_name, icon) = match looked_up {
            Some(info) => {
                let title = info.title_name.clone();
                (
                    info.title_name,
                    info.iso_name.unwrap_or_else(|| title.clone()),
                    info.folder_name.unwrap_or(title),
                    info.icon.unwrap_or_default(),
                )
            }
            None => {
                let title = offline_title(fallback_name);
                (title.clone(), title.clone(), title, Vec::new())
            }
        };

        let god_folder_name = format!(
            "{} [{:08X}]",
            truncate_bytes(&title_name, GOD_FOLDER_NAME_LIMIT),
            exe.title_id()
        );
        let utf16_title = xgdkit_common::str::utf16_title(&title_name, TITLE_NAME_UNITS);

        Self {
            platform: exe.platform(),
            title_id: exe.title_id(),
            unique_name: unique_name(exe.xex_cert()),
            xex_cert: *exe.xex_cert(),
            xbe_cert: exe.xbe_cert().map(|c| Box::new(*c)),
            iso_name: truncate_bytes(&iso_name, ISO_NAME_LIMIT).to_string(),
            folder_name: truncate_bytes(&folder_name, FOLDER_NAME_LIMIT).to_string(),
            god_folder_name,
            title_name,
            utf16_title,
            icon,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn title_id(&self) -> u32 {
        self.title_id
    }

    pub fn title_name(&self) -> &str {
        &self.title_name
    }

    /// Name for a produced image file, without extension.
    pub fn iso_name(&self) -> &str {
        &self.iso_name
    }

    /// Name for a wrapping output folder.
    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    /// Name for a GoD content folder, tagged with the title id.
    pub fn god_folder_name(&self) -> &str {
        &self.god_folder_name
    }

    /// The content-id stem used for GoD output: a stable fingerprint of the
    /// title's identity.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// The display title as stored in the Live header.
    pub fn utf16_title(&self) -> &[u16] {
        &self.utf16_title
    }

    pub fn icon(&self) -> &[u8] {
        &self.icon
    }

    pub fn xex_cert(&self) -> &xex::ExecutionInfo {
        &self.xex_cert
    }

    pub fn xbe_cert(&self) -> Option<&xbe::Cert> {
        self.xbe_cert.as_deref()
    }
}

/// SHA-1 over the identity fields exactly as they sit in the execution info
/// record, truncated to ten bytes of uppercase hex.
fn unique_name(cert: &xex::ExecutionInfo) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytemuck::bytes_of(&cert.title_id));
    hasher.update(bytemuck::bytes_of(&cert.media_id));
    hasher.update([cert.disc_number]);
    hasher.update([cert.disc_count]);
    let digest = hasher.finalize();
    digest[..10].iter().map(|b| format!("{b:02X}")).collect()
}

/// Derives a display title from a dump name: cut at the first qualifier,
/// drop any parenthesised groups, collapse whitespace.
fn offline_title(name: &str) -> String {
    let cut = [name.find(" ("), name.find(" [")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(name.len());
    let mut cleaned = String::with_capacity(name.len());
    let mut depth = 0usize;
    let mut last_was_space = false;
    for c in name[..cut].chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => {
                if c.is_whitespace() {
                    if !last_was_space {
                        cleaned.push(' ');
                    }
                    last_was_space = true;
                } else {
                    cleaned.push(c);
                    last_was_space = false;
                }
            }
            _ => {}
        }
    }
    cleaned.trim().to_string()
}

/// Cuts at the last char boundary within `limit` bytes.
fn truncate_bytes(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use xgdkit_common::types::number::U32Be;

    #[test]
    fn offline_title_strips_qualifiers() {
        assert_eq!(offline_title("Halo 2 (USA) [v1.1]"), "Halo 2");
        assert_eq!(offline_title("Halo   2"), "Halo 2");
        assert_eq!(offline_title("Plain Name"), "Plain Name");
    }

    #[test]
    fn unique_name_is_stable_and_uppercase() {
        let mut cert = xex::ExecutionInfo::zeroed();
        cert.title_id = U32Be::new(0x4156_004F);
        cert.media_id = U32Be::new(0x0102_0304);
        cert.disc_number = 1;
        cert.disc_count = 1;
        let name = unique_name(&cert);
        assert_eq!(name.len(), 20);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, name.to_uppercase());
        // Same identity, same name.
        assert_eq!(name, unique_name(&cert));
        // Different disc, different name.
        cert.disc_number = 2;
        assert_ne!(name, unique_name(&cert));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_bytes("abcdef", 4), "abcd");
        // Multi-byte char straddling the limit is dropped whole.
        assert_eq!(truncate_bytes("ab\u{e9}cd", 3), "ab");
    }
}
