//! Append-only version history plus the "last known" pointer record.
//!
//! Two JSON documents live in the data directory:
//!
//! - `versions.json`: `{versions: [...], lastUpdated}`, newest entry first
//! - `last-version.json`: a copy of the newest entry, or
//!   `{version: null, downloadDate: null, fileDate: null}` while empty
//!
//! Appends hold an advisory exclusive lock on a sibling lock file for the
//! whole read-modify-write. The history and the pointer are replaced by two
//! separate atomic writes; a crash between them leaves the pointer one entry
//! behind until the next successful append.

mod model;

pub use model::{ExtractMetadata, LedgerDocument, LedgerStats, VersionComparison};

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::storage::{StorageLayout, write_json_atomic};

const LOCK_FILE: &str = ".versions.lock";

/// Errors raised by ledger reads and appends.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading, writing or locking a ledger file failed.
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A ledger document is not valid JSON of the expected shape.
    #[error("ledger document {path} is malformed: {source}")]
    Malformed {
        /// Offending document.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    fn malformed(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Malformed {
            path: path.into(),
            source,
        }
    }
}

/// File-backed version ledger.
#[derive(Debug, Clone)]
pub struct VersionLedger {
    ledger_path: PathBuf,
    pointer_path: PathBuf,
    lock_path: PathBuf,
}

impl VersionLedger {
    /// Opens the ledger under `layout`'s data directory, creating both
    /// documents in their empty form if absent.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] when the directory or files cannot be created.
    #[instrument(skip(layout), fields(data_dir = %layout.data_dir().display()))]
    pub fn open(layout: &StorageLayout) -> Result<Self, LedgerError> {
        let data_dir = layout.data_dir();
        fs::create_dir_all(data_dir).map_err(|e| LedgerError::io(data_dir, e))?;

        let ledger = Self {
            ledger_path: layout.ledger_path(),
            pointer_path: layout.pointer_path(),
            lock_path: data_dir.join(LOCK_FILE),
        };

        if !ledger.ledger_path.exists() {
            write_json_atomic(&ledger.ledger_path, &LedgerDocument::default())
                .map_err(|e| LedgerError::io(&ledger.ledger_path, e))?;
            debug!("empty history initialized");
        }
        if !ledger.pointer_path.exists() {
            ledger.write_pointer(None)?;
            debug!("empty pointer initialized");
        }
        Ok(ledger)
    }

    /// Path of the history document.
    #[must_use]
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Path of the pointer document.
    #[must_use]
    pub fn pointer_path(&self) -> &Path {
        &self.pointer_path
    }

    /// Appends `metadata` as the newest entry and updates the pointer.
    ///
    /// Returns `false`, leaving both documents untouched, when the version is
    /// already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the lock, read or either write fails.
    #[instrument(skip(self, metadata), fields(version = %metadata.version))]
    pub fn add_version(&self, metadata: ExtractMetadata) -> Result<bool, LedgerError> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;

        let mut document = self.all_versions()?;
        if document.find(&metadata.version).is_some() {
            warn!("version already recorded; ledger unchanged");
            return Ok(false);
        }

        document.versions.insert(0, metadata.clone());
        document.last_updated = Some(Utc::now());

        write_json_atomic(&self.ledger_path, &document)
            .map_err(|e| LedgerError::io(&self.ledger_path, e))?;
        self.write_pointer(Some(&metadata))?;

        info!(total_versions = document.versions.len(), "version appended");
        Ok(true)
    }

    /// Returns the pointer record; `None` while the ledger is empty.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the pointer cannot be read or parsed.
    pub fn last_version(&self) -> Result<Option<ExtractMetadata>, LedgerError> {
        let Some(raw) = read_optional(&self.pointer_path)? else {
            return Ok(None);
        };
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| LedgerError::malformed(&self.pointer_path, e))?;
        if value.get("version").is_none_or(serde_json::Value::is_null) {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| LedgerError::malformed(&self.pointer_path, e))
    }

    /// Returns the full history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the history cannot be read or parsed.
    pub fn all_versions(&self) -> Result<LedgerDocument, LedgerError> {
        match read_optional(&self.ledger_path)? {
            None => Ok(LedgerDocument::default()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| LedgerError::malformed(&self.ledger_path, e)),
        }
    }

    /// Returns up to `limit` newest entries.
    ///
    /// # Errors
    ///
    /// See [`Self::all_versions`].
    pub fn history(&self, limit: usize) -> Result<Vec<ExtractMetadata>, LedgerError> {
        let mut versions = self.all_versions()?.versions;
        versions.truncate(limit);
        Ok(versions)
    }

    /// Looks up a single version.
    ///
    /// # Errors
    ///
    /// See [`Self::all_versions`].
    pub fn version(&self, version: &str) -> Result<Option<ExtractMetadata>, LedgerError> {
        Ok(self.all_versions()?.find(version).cloned())
    }

    /// Whether `version` is recorded.
    ///
    /// # Errors
    ///
    /// See [`Self::all_versions`].
    pub fn contains(&self, version: &str) -> Result<bool, LedgerError> {
        Ok(self.all_versions()?.find(version).is_some())
    }

    /// Aggregate figures over the history.
    ///
    /// # Errors
    ///
    /// See [`Self::all_versions`].
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        Ok(self.all_versions()?.stats())
    }

    /// Compares the two newest entries.
    ///
    /// # Errors
    ///
    /// See [`Self::all_versions`].
    pub fn compare_latest(&self) -> Result<Option<VersionComparison>, LedgerError> {
        Ok(self.all_versions()?.compare_latest())
    }

    fn write_pointer(&self, entry: Option<&ExtractMetadata>) -> Result<(), LedgerError> {
        let written = match entry {
            Some(entry) => write_json_atomic(&self.pointer_path, entry),
            None => write_json_atomic(
                &self.pointer_path,
                &serde_json::json!({
                    "version": null,
                    "downloadDate": null,
                    "fileDate": null,
                }),
            ),
        };
        written
            .map(|_| ())
            .map_err(|e| LedgerError::io(&self.pointer_path, e))
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, LedgerError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LedgerError::io(path, e)),
    }
}

/// Exclusive advisory lock held for the lifetime of the guard.
struct LedgerLock {
    file: File,
}

impl LedgerLock {
    fn acquire(path: &Path) -> Result<Self, LedgerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LedgerError::io(path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| LedgerError::io(path, e))?;
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
