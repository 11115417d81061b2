//! On-disk layout and atomic file replacement.
//!
//! | Artifact | Path |
//! |----------|------|
//! | archive  | `<downloads>/sepomex-<version>.zip` |
//! | extract  | `<downloads>/<version>.txt` |
//! | dataset  | `<data>/<version>.json` |
//! | ledger   | `<data>/versions.json` |
//! | pointer  | `<data>/last-version.json` |

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Serialize;

/// Default downloads directory (relative to the working directory).
pub const DEFAULT_DOWNLOADS_DIR: &str = "./downloads";
/// Default data directory (relative to the working directory).
pub const DEFAULT_DATA_DIR: &str = "./data";

const LEDGER_FILE: &str = "versions.json";
const POINTER_FILE: &str = "last-version.json";

/// Where every artifact of a version lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    downloads_dir: PathBuf,
    data_dir: PathBuf,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DOWNLOADS_DIR, DEFAULT_DATA_DIR)
    }
}

impl StorageLayout {
    /// Creates a layout rooted at the two directories.
    pub fn new(downloads_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Directory holding archives and extracts.
    #[must_use]
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Directory holding datasets, the ledger and the pointer.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn archive_path(&self, version: &str) -> PathBuf {
        self.downloads_dir.join(format!("sepomex-{version}.zip"))
    }

    #[must_use]
    pub fn extract_path(&self, version: &str) -> PathBuf {
        self.downloads_dir.join(format!("{version}.txt"))
    }

    #[must_use]
    pub fn dataset_path(&self, version: &str) -> PathBuf {
        self.data_dir.join(format!("{version}.json"))
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }

    #[must_use]
    pub fn pointer_path(&self) -> PathBuf {
        self.data_dir.join(POINTER_FILE)
    }

    /// Creates both directories if missing.
    ///
    /// # Errors
    ///
    /// Returns the first directory creation failure.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.downloads_dir)?;
        fs::create_dir_all(&self.data_dir)
    }

    /// Reports which artifacts of `version` exist on disk.
    #[must_use]
    pub fn artifacts(&self, version: &str) -> ArtifactPresence {
        ArtifactPresence {
            zip: self.archive_path(version).is_file(),
            txt: self.extract_path(version).is_file(),
            json: self.dataset_path(version).is_file(),
        }
    }
}

/// Presence of each artifact kind for one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArtifactPresence {
    pub zip: bool,
    pub txt: bool,
    pub json: bool,
}

/// Replaces `path` with `content` via a sibling temp file and rename.
///
/// Readers observe either the previous file or the complete new one.
///
/// # Errors
///
/// Returns the IO error of the write or rename; the temp file is removed.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let suffix: u32 = rand::thread_rng().r#gen();
    let tmp_path = parent.join(format!(
        ".{}.{}.{suffix:08x}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    if let Err(error) = write_synced(&tmp_path, content) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })
}

fn write_synced(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns an IO error for serialization or write failures.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<u64> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)?;
    Ok(bytes.len() as u64)
}
