//! Logical streams over images split across multiple physical files.
//!
//! OG Xbox FATX volumes cap files at 4 GiB, so large images ship as a
//! `name.1.iso` / `name.2.iso` pair. [`SplitReader`] presents such a pair
//! (or a single file) as one seekable stream; [`SplitWriter`] produces one,
//! rolling to the next part once the configured cut size is reached, and
//! renames a single-part output back to its base name on close.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub struct SplitReader {
    parts: Vec<ReadPart>,
    position: u64,
    total_size: u64,
}

struct ReadPart {
    file: File,
    size: u64,
}

impl SplitReader {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut parts = Vec::with_capacity(paths.len());
        let mut total_size = 0;
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path).map_err(|source| Error::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
            let size = file.metadata()?.len();
            total_size += size;
            parts.push(ReadPart { file, size });
        }
        if parts.is_empty() {
            return Err(Error::Other("no input paths".into()));
        }
        let mut reader = Self {
            parts,
            position: 0,
            total_size,
        };
        reader.seek(SeekFrom::Start(0))?;
        Ok(reader)
    }

    pub fn len(&self) -> u64 {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    /// Reads an exact span at an absolute offset.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }

    fn part_for(&self, position: u64) -> (usize, u64) {
        let mut remaining = position;
        for (idx, part) in self.parts.iter().enumerate() {
            if remaining < part.size || idx == self.parts.len() - 1 {
                return (idx, remaining);
            }
            remaining -= part.size;
        }
        unreachable!("parts is non-empty");
    }
}

impl Read for SplitReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.total_size || buf.is_empty() {
            return Ok(0);
        }
        let (idx, in_part) = self.part_for(self.position);
        let part = &mut self.parts[idx];
        part.file.seek(SeekFrom::Start(in_part))?;
        let available = (part.size - in_part).min(buf.len() as u64) as usize;
        let read = part.file.read(&mut buf[..available])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for SplitReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.total_size as i64 + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

pub struct SplitWriter {
    parent: PathBuf,
    stem: String,
    extension: String,
    cut_size: u64,
    parts: Vec<WritePart>,
    position: u64,
    length: u64,
}

struct WritePart {
    file: File,
    path: PathBuf,
}

impl SplitWriter {
    /// Creates a writer for `base_path`, cutting to a new part whenever the
    /// logical position reaches a multiple of `cut_size`. Pass `u64::MAX` to
    /// disable splitting.
    pub fn create(base_path: &Path, cut_size: u64) -> Result<Self> {
        let parent = base_path.parent().unwrap_or(Path::new("")).to_path_buf();
        let stem = base_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = base_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut writer = Self {
            parent,
            stem,
            extension,
            cut_size,
            parts: Vec::new(),
            position: 0,
            length: 0,
        };
        writer.open_part(0)?;
        Ok(writer)
    }

    pub fn base_path(&self) -> PathBuf {
        self.parent.join(format!("{}{}", self.stem, self.extension))
    }

    fn part_path(&self, index: usize) -> PathBuf {
        self.parent
            .join(format!("{}.{}{}", self.stem, index + 1, self.extension))
    }

    fn open_part(&mut self, index: usize) -> Result<()> {
        debug_assert_eq!(index, self.parts.len());
        let path = self.part_path(index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::FileOpen {
                path: path.clone(),
                source,
            })?;
        self.parts.push(WritePart { file, path });
        Ok(())
    }

    pub fn stream_position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Seeks to the end of everything written so far.
    pub fn seek_end(&mut self) -> Result<u64> {
        let end = self.length;
        self.seek_to(end)?;
        Ok(end)
    }

    /// Absolute seek, spanning parts. Seeking into a part that does not
    /// exist yet creates it.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        let part = if self.cut_size == u64::MAX {
            0
        } else {
            (position.saturating_sub(1) / self.cut_size) as usize
        };
        while self.parts.len() <= part {
            let next = self.parts.len();
            self.open_part(next)?;
        }
        let in_part = position - part as u64 * self.cut_size;
        self.parts[part].file.seek(SeekFrom::Start(in_part))?;
        self.position = position;
        Ok(())
    }

    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let part = if self.cut_size == u64::MAX {
                0
            } else {
                (self.position / self.cut_size) as usize
            };
            while self.parts.len() <= part {
                let next = self.parts.len();
                self.open_part(next)?;
            }
            let in_part = self.position - part as u64 * self.cut_size;
            let room = if self.cut_size == u64::MAX {
                buf.len() as u64
            } else {
                (self.cut_size - in_part).min(buf.len() as u64)
            };
            let file = &mut self.parts[part].file;
            file.seek(SeekFrom::Start(in_part))?;
            file.write_all(&buf[..room as usize])?;
            self.position += room;
            buf = &buf[room as usize..];
        }
        self.length = self.length.max(self.position);
        Ok(())
    }

    /// Pads with `pad_byte` from the current position up to the next
    /// multiple of `modulus`.
    pub fn pad_to_modulus(&mut self, modulus: u64, pad_byte: u8) -> Result<()> {
        let rem = self.position % modulus;
        if rem != 0 {
            let padding = vec![pad_byte; (modulus - rem) as usize];
            self.write_all(&padding)?;
        }
        Ok(())
    }

    /// Flushes and closes every part. A single-part output is renamed from
    /// `name.1.ext` back to `name.ext`.
    pub fn close(mut self) -> Result<Vec<PathBuf>> {
        for part in &mut self.parts {
            part.file.flush()?;
        }
        if self.parts.len() == 1 {
            let from = self.parts[0].path.clone();
            let to = self.base_path();
            std::fs::rename(&from, &to).map_err(|source| Error::Rename { from, to: to.clone(), source })?;
            return Ok(vec![to]);
        }
        Ok(self.parts.iter().map(|p| p.path.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_renames_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("image.iso");
        let mut writer = SplitWriter::create(&base, u64::MAX).unwrap();
        writer.write_all(b"hello").unwrap();
        let paths = writer.close().unwrap();
        assert_eq!(paths, vec![base.clone()]);
        assert_eq!(std::fs::read(base).unwrap(), b"hello");
        assert!(!dir.path().join("image.1.iso").exists());
    }

    #[test]
    fn writes_roll_over_the_cut() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("image.iso");
        let mut writer = SplitWriter::create(&base, 8).unwrap();
        writer.write_all(b"0123456789abcdef01").unwrap();
        let paths = writer.close().unwrap();
        assert_eq!(paths.len(), 3);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"01234567");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"89abcdef");
        assert_eq!(std::fs::read(&paths[2]).unwrap(), b"01");
        assert_eq!(paths[0], dir.path().join("image.1.iso"));
        assert_eq!(paths[1], dir.path().join("image.2.iso"));
    }

    #[test]
    fn seek_spans_parts() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("image.iso");
        let mut writer = SplitWriter::create(&base, 8).unwrap();
        writer.write_all(&[0u8; 16]).unwrap();
        writer.seek_to(6).unwrap();
        writer.write_all(b"XYZW").unwrap();
        let paths = writer.close().unwrap();
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"\0\0\0\0\0\0XY");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"ZW\0\0\0\0\0\0");
    }

    #[test]
    fn reader_joins_parts() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("image.1.iso");
        let b = dir.path().join("image.2.iso");
        std::fs::write(&a, b"01234567").unwrap();
        std::fs::write(&b, b"89").unwrap();
        let mut reader = SplitReader::open(&[a, b]).unwrap();
        assert_eq!(reader.len(), 10);
        let mut buf = [0u8; 4];
        reader.read_exact_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"6789");
    }
}
