//! xgdkit-iso
//!
//! Reading, authoring and transcoding of Xbox and Xbox 360 disc images.
//! The supported containers share one logical filesystem (the XISO directory
//! tree) and differ in how its sectors are stored on disk:
//!
//! * raw XISO, optionally split across two files,
//! * CCI, per-sector LZ4 block compression with a packed index,
//! * CSO, per-sector LZ4 frame compression with an inline index,
//! * GoD ("Games on Demand"), sectors remapped into SHA-1 hash-tree parts,
//! * plain extracted directories.
//!
//! [`read::ImageReader`] gives uniform sector access over any container;
//! [`avl::AvlTree`] plans a fresh byte-exact layout from a directory or an
//! existing image; the writers in [`write`] emit each container either by
//! sector pass-through or from an AVL plan.

pub mod avl;
pub mod cancel;
pub mod exe;
pub mod extract;
pub mod formats;
pub mod layout;
pub mod read;
pub mod split;
pub mod title;
pub mod write;

use std::path::PathBuf;

/// Errors that can occur while reading, planning or writing an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open {path}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A read, write or seek on an already-open file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to create directory {path}")]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} to {to}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing file: {0}")]
    Missing(PathBuf),

    #[error("duplicate name in directory: {0}")]
    DuplicateName(String),

    #[error("value exceeds format limit: {0}")]
    Overflow(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid xbe: {0}")]
    InvalidXbe(String),

    #[error("invalid xex: {0}")]
    InvalidXex(String),

    #[error("name not representable on disc: {0}")]
    Encoding(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Which console family an image targets, decided by its boot executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Original Xbox (`default.xbe`).
    Ogx,
    /// Xbox 360 (`default.xex`).
    X360,
}

/// How much of the source image is carried into the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScrubType {
    /// Byte-for-byte sector copy.
    #[default]
    None,
    /// Keep the layout but zero every sector that holds no data.
    Partial,
    /// Reauthor the image from its directory tree; smallest possible output.
    Full,
}

pub(crate) fn create_dir_all(path: &std::path::Path) -> Result<()> {
    if !path.as_os_str().is_empty() && !path.exists() {
        std::fs::create_dir_all(path).map_err(|source| Error::DirectoryCreate {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
