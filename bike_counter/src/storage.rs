//! Persistence of uploaded videos.
//!
//! Uploads land in a single media directory. The client-supplied name is reduced
//! to a safe basename, and an existing file is never overwritten: a numeric
//! suffix is appended instead (`clip.mp4`, `clip_1.mp4`, `clip_2.mp4`, ...).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::StorageError;

const FALLBACK_STEM: &str = "upload";
const MAX_SUFFIX: u32 = 10_000;

/// Stores uploaded bytes and returns the path a decoder can open.
pub trait VideoStorage: Send + Sync {
    fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<PathBuf, StorageError>;
}

#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Storage rooted at `root`; the directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ensure_root(&self) -> Result<PathBuf, StorageError> {
        let directory = |source| StorageError::Directory {
            path: self.root.clone(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(directory)?;
        fs::canonicalize(&self.root).map_err(directory)
    }
}

impl VideoStorage for FileSystemStorage {
    fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<PathBuf, StorageError> {
        let root = self.ensure_root()?;
        let safe_name = sanitize_file_name(suggested_name);
        let (stem, ext) = split_name(&safe_name);

        for attempt in 0..MAX_SUFFIX {
            let name = match (attempt, ext) {
                (0, Some(ext)) => format!("{stem}.{ext}"),
                (0, None) => stem.to_string(),
                (n, Some(ext)) => format!("{stem}_{n}.{ext}"),
                (n, None) => format!("{stem}_{n}"),
            };
            let path = root.join(&name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(StorageError::Write { path, source }),
            };
            if let Err(source) = file.write_all(bytes).and_then(|()| file.sync_all()) {
                let _ = fs::remove_file(&path);
                return Err(StorageError::Write { path, source });
            }
            debug!(path = %path.display(), bytes = bytes.len(), "upload stored");
            return Ok(path);
        }

        Err(StorageError::NameExhausted(stem.to_string(), MAX_SUFFIX))
    }
}

/// Reduce a client-supplied file name to a basename made of safe characters.
pub fn sanitize_file_name(name: &str) -> String {
    // Both separators: browsers on Windows may send full paths.
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '_' || c == '.') {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}
