//! Input autodetection.
//!
//! A path on the command line may be a single image, one member of a split
//! pair, a GoD content directory, an extracted game directory, or a batch
//! directory holding any mix of those.

use std::path::{Path, PathBuf};

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Iso,
    Cci,
    Cso,
    God,
    ExtractedDir,
}

#[derive(Debug, Clone)]
pub struct InputInfo {
    pub kind: InputKind,
    /// One path, or both members of a split pair in order.
    pub paths: Vec<PathBuf>,
}

/// Expands a command-line path into the list of convertible inputs.
pub fn gather_inputs(path: &Path) -> Result<Vec<InputInfo>> {
    if let Some(info) = detect(path)? {
        return Ok(vec![info]);
    }

    // Not a recognized input itself; treat as a batch directory.
    let mut inputs = Vec::new();
    if path.is_dir() {
        let mut children: Vec<PathBuf> = std::fs::read_dir(path)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        children.sort();
        for child in children {
            // The second member of a split pair is picked up with its first.
            if child.is_file() && split_member(&child) == Some(2) {
                continue;
            }
            if let Some(info) = detect(&child)? {
                inputs.push(info);
            }
        }
    }
    anyhow::ensure!(
        !inputs.is_empty(),
        "no convertible input found at {}",
        path.display()
    );
    Ok(inputs)
}

fn detect(path: &Path) -> Result<Option<InputInfo>> {
    if path.is_file() {
        let kind = match extension_of(path).as_deref() {
            Some("iso") => InputKind::Iso,
            Some("cci") => InputKind::Cci,
            Some("cso") => InputKind::Cso,
            _ => return Ok(None),
        };
        return Ok(Some(InputInfo {
            kind,
            paths: split_pair(path),
        }));
    }

    if path.is_dir() {
        if god_data_dir(path, 2).is_some() {
            return Ok(Some(InputInfo {
                kind: InputKind::God,
                paths: vec![path.to_path_buf()],
            }));
        }
        if is_extracted_dir(path)? {
            return Ok(Some(InputInfo {
                kind: InputKind::ExtractedDir,
                paths: vec![path.to_path_buf()],
            }));
        }
    }
    Ok(None)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// The split part number, if the stem ends in `.1` or `.2`.
fn split_member(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    match stem.rsplit_once('.') {
        Some((_, "1")) => Some(1),
        Some((_, "2")) => Some(2),
        _ => None,
    }
}

/// For a split member, both parts that exist, in order; for a plain image,
/// just itself.
fn split_pair(path: &Path) -> Vec<PathBuf> {
    if split_member(path).is_none() {
        return vec![path.to_path_buf()];
    }
    let stem = path.file_stem().unwrap().to_string_lossy().into_owned();
    let base = stem.rsplit_once('.').unwrap().0.to_string();
    let ext = extension_of(path).unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new(""));

    let part = |n: u32| parent.join(format!("{base}.{n}.{ext}"));
    let (part_1, part_2) = (part(1), part(2));
    let mut paths = Vec::new();
    if part_1.exists() {
        paths.push(part_1);
    }
    if part_2.exists() {
        paths.push(part_2);
    }
    if paths.is_empty() {
        // A stem that merely looks numbered.
        paths.push(path.to_path_buf());
    }
    paths
}

/// Finds a `*.data` directory holding `Data*` files, within `depth` levels.
fn god_data_dir(path: &Path, depth: u32) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    if name.ends_with(".data") && has_data_files(path) {
        return Some(path.to_path_buf());
    }
    if depth == 0 {
        return None;
    }
    for entry in std::fs::read_dir(path).ok()?.flatten() {
        if entry.file_type().ok()?.is_dir() {
            if let Some(found) = god_data_dir(&entry.path(), depth - 1) {
                return Some(found);
            }
        }
    }
    None
}

fn has_data_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry.path().is_file()
                    && entry
                        .file_name()
                        .to_string_lossy()
                        .to_lowercase()
                        .starts_with("data")
            })
        })
        .unwrap_or(false)
}

/// An extracted game: a boot executable at the top and no image files.
fn is_extracted_dir(dir: &Path) -> Result<bool> {
    let mut has_executable = false;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name == "default.xbe" || name == "default.xex" {
            has_executable = true;
        }
        if matches!(
            extension_of(&entry.path()).as_deref(),
            Some("iso") | Some("cci") | Some("cso")
        ) {
            return Ok(false);
        }
    }
    Ok(has_executable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_single_image_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.iso");
        std::fs::write(&path, b"x").unwrap();
        let info = detect(&path).unwrap().unwrap();
        assert_eq!(info.kind, InputKind::Iso);
        assert_eq!(info.paths, vec![path]);
    }

    #[test]
    fn joins_split_pair_from_either_member() {
        let dir = tempfile::tempdir().unwrap();
        let part_1 = dir.path().join("game.1.iso");
        let part_2 = dir.path().join("game.2.iso");
        std::fs::write(&part_1, b"x").unwrap();
        std::fs::write(&part_2, b"y").unwrap();

        for member in [&part_1, &part_2] {
            let info = detect(member).unwrap().unwrap();
            assert_eq!(info.paths, vec![part_1.clone(), part_2.clone()]);
        }
    }

    #[test]
    fn detects_extracted_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.xbe"), b"x").unwrap();
        std::fs::write(dir.path().join("data.bin"), b"y").unwrap();
        let info = detect(dir.path()).unwrap().unwrap();
        assert_eq!(info.kind, InputKind::ExtractedDir);
    }

    #[test]
    fn image_file_beats_extracted_detection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.xbe"), b"x").unwrap();
        std::fs::write(dir.path().join("game.iso"), b"y").unwrap();
        assert!(detect(dir.path()).unwrap().is_none());
        // As a batch dir it still yields the image.
        let inputs = gather_inputs(dir.path()).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].kind, InputKind::Iso);
    }

    #[test]
    fn detects_god_content_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("00007000/ABCDEF.data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("Data0000"), b"x").unwrap();
        let info = detect(dir.path()).unwrap().unwrap();
        assert_eq!(info.kind, InputKind::God);
    }

    #[test]
    fn batch_directory_skips_second_members() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.1.iso"), b"x").unwrap();
        std::fs::write(dir.path().join("a.2.iso"), b"y").unwrap();
        std::fs::write(dir.path().join("b.cso"), b"z").unwrap();
        let inputs = gather_inputs(dir.path()).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].paths.len(), 2);
        assert_eq!(inputs[1].kind, InputKind::Cso);
    }
}
