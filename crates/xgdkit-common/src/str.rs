//! String handling for on-disc names and title metadata.
//!
//! XISO directory entries carry names in Windows-1252; the GoD Live header
//! carries the display title in UTF-16LE. Host-side file names additionally
//! need screening before they are created on the local filesystem.

use encoding_rs::WINDOWS_1252;

/// Encodes a UTF-8 name into Windows-1252 bytes for a directory entry.
///
/// Returns `None` if the name contains characters outside the code page or
/// does not fit the entry's u8 length field.
pub fn encode_entry_name(name: &str) -> Option<Vec<u8>> {
    let mut encoder = WINDOWS_1252.new_encoder();
    let mut buffer = vec![0u8; name.len() * 2 + 8];
    let (result, read, written) =
        encoder.encode_from_utf8_without_replacement(name, &mut buffer, true);
    if !matches!(result, encoding_rs::EncoderResult::InputEmpty) || read != name.len() {
        return None;
    }
    if written > u8::MAX as usize {
        return None;
    }
    buffer.truncate(written);
    Some(buffer)
}

/// Decodes directory-entry name bytes into UTF-8.
///
/// Returns `None` when the bytes are not valid Windows-1252.
pub fn decode_entry_name(bytes: &[u8]) -> Option<String> {
    WINDOWS_1252
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|cow| cow.into_owned())
}

/// Decodes directory-entry name bytes, substituting the replacement
/// character for bytes undefined in the code page.
pub fn decode_entry_name_lossy(bytes: &[u8]) -> String {
    WINDOWS_1252.decode(bytes).0.into_owned()
}

/// Converts a title to the UTF-16LE code units stored in the Live header,
/// truncated to `max_units`.
pub fn utf16_title(title: &str, max_units: usize) -> Vec<u16> {
    let mut units: Vec<u16> = title.encode_utf16().collect();
    if units.len() > max_units {
        units.truncate(max_units);
    }
    units
}

const RESERVED_DOS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Whether an on-disc name is safe to materialize on the host filesystem.
///
/// Rejects reserved DOS device names, parent-directory references, and
/// current-directory prefixes that could escape the extraction root.
pub fn is_safe_name(name: &str) -> bool {
    if name.is_empty() || name == ".." || name.contains("../") || name.contains("..\\") {
        return false;
    }
    if name.starts_with("./") || name.starts_with(".\\") {
        return false;
    }
    let stem = name.split('.').next().unwrap_or(name);
    !RESERVED_DOS_NAMES
        .iter()
        .any(|r| stem.eq_ignore_ascii_case(r))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_round_trip() {
        let encoded = encode_entry_name("default.xbe").unwrap();
        assert_eq!(encoded, b"default.xbe");
        assert_eq!(decode_entry_name(&encoded).unwrap(), "default.xbe");
    }

    #[test]
    fn entry_name_high_cp1252() {
        // U+00E9 maps to 0xE9 in Windows-1252.
        let encoded = encode_entry_name("caf\u{e9}").unwrap();
        assert_eq!(encoded, [b'c', b'a', b'f', 0xE9]);
        assert_eq!(decode_entry_name(&encoded).unwrap(), "caf\u{e9}");
    }

    #[test]
    fn entry_name_outside_codepage() {
        assert!(encode_entry_name("\u{4e2d}\u{6587}").is_none());
    }

    #[test]
    fn utf16_title_truncates() {
        let units = utf16_title("abcdef", 4);
        assert_eq!(units, [0x61, 0x62, 0x63, 0x64]);
    }

    #[test]
    fn unsafe_names_rejected() {
        assert!(!is_safe_name(".."));
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name("./hidden"));
        assert!(!is_safe_name("con"));
        assert!(!is_safe_name("NUL.txt"));
        assert!(is_safe_name("default.xbe"));
        assert!(is_safe_name("data.bin"));
    }
}
