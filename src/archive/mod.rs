//! Payload extraction from the published zip archive.
//!
//! The archive carries a single pipe-delimited text file next to files that
//! are of no interest (readme, layout notes). Entries are scanned in order and
//! the first file with the payload extension is written, flattened, into the
//! output directory.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Extension of the payload inside the archive (compared ASCII case-insensitively).
pub const PAYLOAD_EXTENSION: &str = "txt";

/// Errors raised while extracting the payload.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Local file system failure.
    #[error("archive I/O error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The container could not be read as a zip archive.
    #[error("invalid zip archive {path}: {source}")]
    InvalidArchive {
        /// Archive path.
        path: PathBuf,
        /// Underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// No entry with the expected extension.
    #[error("no .{extension} entry in archive {path}")]
    MissingPayload {
        /// Archive path.
        path: PathBuf,
        /// Extension that was searched for.
        extension: String,
    },
}

impl ArchiveError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid-archive error.
    pub fn invalid_archive(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::InvalidArchive {
            path: path.into(),
            source,
        }
    }
}

/// Extracts the text payload of `archive_path` into `output_dir`.
///
/// # Errors
///
/// See [`extract_with_extension`].
pub fn extract(archive_path: &Path, output_dir: &Path) -> Result<PathBuf, ArchiveError> {
    extract_with_extension(archive_path, output_dir, PAYLOAD_EXTENSION)
}

/// Extracts the first file entry ending in `.{extension}`.
///
/// The entry is written under its bare file name; directories in the entry
/// path are dropped. Entries whose path escapes the archive root are skipped.
/// An existing file of the same name is overwritten.
///
/// # Errors
///
/// Returns [`ArchiveError::InvalidArchive`] if the file is not a readable zip,
/// [`ArchiveError::MissingPayload`] if no entry matches, and
/// [`ArchiveError::Io`] if the output cannot be written.
#[instrument(fields(archive = %archive_path.display()))]
pub fn extract_with_extension(
    archive_path: &Path,
    output_dir: &Path,
    extension: &str,
) -> Result<PathBuf, ArchiveError> {
    let file = File::open(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| ArchiveError::invalid_archive(archive_path, e))?;

    let suffix = format!(".{}", extension.to_ascii_lowercase());

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ArchiveError::invalid_archive(archive_path, e))?;

        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(&suffix) {
            continue;
        }

        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(PathBuf::from))
        else {
            warn!(entry = entry.name(), "skipping entry with unsafe path");
            continue;
        };

        debug!(entry = entry.name(), "payload entry found");
        fs::create_dir_all(output_dir).map_err(|e| ArchiveError::io(output_dir, e))?;
        let target = output_dir.join(file_name);

        if let Err(error) = write_entry(&mut entry, &target) {
            let _ = fs::remove_file(&target);
            return Err(error);
        }

        info!(path = %target.display(), bytes = entry.size(), "payload extracted");
        return Ok(target);
    }

    Err(ArchiveError::MissingPayload {
        path: archive_path.to_path_buf(),
        extension: extension.to_string(),
    })
}

fn write_entry(entry: &mut impl io::Read, target: &Path) -> Result<(), ArchiveError> {
    let out = File::create(target).map_err(|e| ArchiveError::io(target, e))?;
    let mut writer = BufWriter::new(out);
    io::copy(entry, &mut writer).map_err(|e| ArchiveError::io(target, e))?;
    writer.flush().map_err(|e| ArchiveError::io(target, e))
}

/// Renames an extracted payload to `<version>.<ext>` in the same directory.
///
/// A previous file with the target name is replaced.
///
/// # Errors
///
/// Returns [`ArchiveError::Io`] when the rename fails.
pub fn rename_to_version(extracted: &Path, version: &str) -> Result<PathBuf, ArchiveError> {
    let extension = extracted.extension().map_or_else(
        || PAYLOAD_EXTENSION.to_string(),
        |e| e.to_string_lossy().to_ascii_lowercase(),
    );
    let target = extracted.with_file_name(format!("{version}.{extension}"));
    if target == extracted {
        return Ok(target);
    }
    if target.exists() {
        fs::remove_file(&target).map_err(|e| ArchiveError::io(&target, e))?;
    }
    fs::rename(extracted, &target).map_err(|e| ArchiveError::io(extracted, e))?;
    debug!(from = %extracted.display(), to = %target.display(), "extract renamed");
    Ok(target)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_picks_text_entry_and_ignores_others() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("sepomex.zip");
        write_zip(
            &archive,
            &[
                ("LEAME.pdf", "%PDF"),
                ("CPdescarga.txt", "payload"),
                ("otro.txt", "second"),
            ],
        );

        let out_dir = temp.path().join("out");
        let extracted = extract(&archive, &out_dir).unwrap();

        assert_eq!(extracted, out_dir.join("CPdescarga.txt"));
        assert_eq!(fs::read(&extracted).unwrap(), b"payload");
        assert!(!out_dir.join("LEAME.pdf").exists());
        assert!(!out_dir.join("otro.txt").exists());
    }

    #[test]
    fn test_extract_flattens_nested_entry_and_matches_uppercase() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("nested.zip");
        write_zip(
            &archive,
            &[("datos/", ""), ("datos/CPDESCARGA.TXT", "nested payload")],
        );

        let extracted = extract(&archive, temp.path()).unwrap();
        assert_eq!(extracted, temp.path().join("CPDESCARGA.TXT"));
        assert_eq!(fs::read(extracted).unwrap(), b"nested payload");
    }

    #[test]
    fn test_extract_skips_unsafe_entry() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.zip");
        write_zip(
            &archive,
            &[("../escape.txt", "evil"), ("safe.txt", "good")],
        );

        let out_dir = temp.path().join("out");
        let extracted = extract(&archive, &out_dir).unwrap();
        assert_eq!(extracted, out_dir.join("safe.txt"));
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_without_text_entry_is_missing_payload() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("no-text.zip");
        write_zip(&archive, &[("data.csv", "a,"), ("notes.txt.bak", "x")]);

        let result = extract(&archive, temp.path());
        assert!(matches!(result, Err(ArchiveError::MissingPayload { .. })));
    }

    #[test]
    fn test_extract_html_body_is_invalid_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("error-page.zip");
        fs::write(&archive, b"<html><body>Error</body></html>").unwrap();

        let result = extract(&archive, temp.path());
        assert!(matches!(result, Err(ArchiveError::InvalidArchive { .. })));
    }

    #[test]
    fn test_extract_missing_archive_is_io() {
        let temp = TempDir::new().unwrap();
        let result = extract(&temp.path().join("absent.zip"), temp.path());
        assert!(matches!(result, Err(ArchiveError::Io { .. })));
    }

    #[test]
    fn test_rename_to_version_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let extracted = temp.path().join("CPdescarga.txt");
        fs::write(&extracted, b"new").unwrap();
        fs::write(temp.path().join("20240105.txt"), b"old").unwrap();

        let renamed = rename_to_version(&extracted, "20240105").unwrap();

        assert_eq!(renamed, temp.path().join("20240105.txt"));
        assert_eq!(fs::read(&renamed).unwrap(), b"new");
        assert!(!extracted.exists());
    }

    #[test]
    fn test_rename_to_version_same_name_is_noop() {
        let temp = TempDir::new().unwrap();
        let extracted = temp.path().join("20240105.txt");
        fs::write(&extracted, b"data").unwrap();

        let renamed = rename_to_version(&extracted, "20240105").unwrap();
        assert_eq!(renamed, extracted);
        assert_eq!(fs::read(&renamed).unwrap(), b"data");
    }
}
