//! Conversion of the legacy text extract into the postal-code dataset.
//!
//! The extract is a single-byte encoded, pipe-delimited file with a two-line
//! preamble. Each data line describes one neighborhood; lines sharing a
//! postal code are folded into one [`PostalRecord`].

mod record;

pub use record::{CODE_WIDTH, Dataset, FieldLayout, ParsedLine, PostalRecord, normalize_code};

use std::collections::btree_map::Entry;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::storage::write_json_atomic;

/// Encoding label used when none is configured.
pub const DEFAULT_ENCODING_LABEL: &str = "latin1";

/// Lines of preamble before the first data line.
pub const DEFAULT_HEADER_LINES: usize = 2;

/// Accepted-record interval between progress log lines.
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Errors raised while transcoding an extract.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The configured encoding label is not a known WHATWG label.
    #[error("unknown text encoding label '{label}'")]
    UnknownEncoding {
        /// Label as configured.
        label: String,
    },

    /// Reading the extract or writing the dataset failed.
    #[error("transcode I/O error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl TranscodeError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A resolved single-byte text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncoding(&'static Encoding);

impl TextEncoding {
    /// Resolves a WHATWG encoding label such as `latin1` or `windows-1252`.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::UnknownEncoding`] for unknown labels.
    pub fn from_label(label: &str) -> Result<Self, TranscodeError> {
        Encoding::for_label(label.trim().as_bytes())
            .map(Self)
            .ok_or_else(|| TranscodeError::UnknownEncoding {
                label: label.to_string(),
            })
    }

    /// Canonical name of the encoding.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Decodes `bytes`; unmappable sequences become U+FFFD.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, had_errors) = self.0.decode_without_bom_handling(bytes);
        if had_errors {
            warn!(encoding = self.name(), "extract contains bytes invalid for encoding");
        }
        text.into_owned()
    }
}

impl Default for TextEncoding {
    fn default() -> Self {
        Self(encoding_rs::WINDOWS_1252)
    }
}

/// Knobs for [`Transcoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub encoding: TextEncoding,
    pub layout: FieldLayout,
    pub header_lines: usize,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            encoding: TextEncoding::default(),
            layout: FieldLayout::default(),
            header_lines: DEFAULT_HEADER_LINES,
        }
    }
}

/// Result of one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    /// Accepted data lines.
    pub record_count: u64,
    /// Distinct postal codes.
    pub unique_key_count: u64,
    pub dataset: Dataset,
    /// Where the dataset was persisted.
    pub dataset_path: PathBuf,
    /// Size of the persisted dataset file.
    pub dataset_bytes: u64,
}

/// Builds datasets from extracts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transcoder {
    options: TranscodeOptions,
}

impl Transcoder {
    #[must_use]
    pub fn new(options: TranscodeOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &TranscodeOptions {
        &self.options
    }

    /// Decodes `text_path`, builds the dataset and persists it to `dataset_path`.
    ///
    /// The dataset file is replaced atomically before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::Io`] when the extract cannot be read or the
    /// dataset cannot be written.
    #[instrument(skip(self), fields(text = %text_path.display()))]
    pub fn convert(
        &self,
        text_path: &Path,
        version: &str,
        dataset_path: &Path,
    ) -> Result<Conversion, TranscodeError> {
        let bytes = fs::read(text_path).map_err(|e| TranscodeError::io(text_path, e))?;
        debug!(bytes = bytes.len(), encoding = self.options.encoding.name(), "decoding extract");
        let text = self.options.encoding.decode(&bytes);
        drop(bytes);

        let (dataset, record_count) = self.build_dataset(&text);
        let unique_key_count = dataset.len() as u64;

        let dataset_bytes =
            write_json_atomic(dataset_path, &dataset).map_err(|e| TranscodeError::io(dataset_path, e))?;

        info!(
            version,
            records = record_count,
            postal_codes = unique_key_count,
            bytes = dataset_bytes,
            path = %dataset_path.display(),
            "dataset written"
        );

        Ok(Conversion {
            record_count,
            unique_key_count,
            dataset,
            dataset_path: dataset_path.to_path_buf(),
            dataset_bytes,
        })
    }

    /// Folds decoded extract text into a dataset.
    ///
    /// Returns the dataset and the number of accepted lines.
    #[must_use]
    pub fn build_dataset(&self, text: &str) -> (Dataset, u64) {
        let mut dataset = Dataset::new();
        let mut record_count: u64 = 0;
        let mut skipped: u64 = 0;

        for line in text.lines().skip(self.options.header_lines) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(parsed) = self.options.layout.parse_line(line) else {
                skipped += 1;
                continue;
            };

            match dataset.entry(parsed.code) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().add_neighborhood(parsed.neighborhood);
                }
                Entry::Vacant(entry) => {
                    let code = entry.key().clone();
                    entry.insert(PostalRecord {
                        code,
                        state: parsed.state.to_string(),
                        municipality: parsed.municipality.to_string(),
                        city: parsed.city.to_string(),
                        neighborhoods: vec![parsed.neighborhood.to_string()],
                    });
                }
            }

            record_count += 1;
            if record_count % PROGRESS_INTERVAL == 0 {
                info!(records = record_count, "transcoding progress");
            }
        }

        if skipped > 0 {
            debug!(skipped, "lines skipped (short or without a valid code)");
        }
        (dataset, record_count)
    }
}
