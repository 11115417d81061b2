//! SEPOMEX Sync Core Library
//!
//! Keeps a local, versioned copy of the Mexican postal code catalogue
//! published by SEPOMEX. A run probes the legacy export page, downloads the
//! zip archive through the page's form, extracts and transcodes the
//! pipe-delimited text into a JSON dataset, records the version in an
//! append-only ledger and tells the in-memory cache to reload.
//!
//! # Architecture
//!
//! - [`source`] - Landing page scraping, version detection and the form download
//! - [`download`] - HTTP client, streaming download and retry policy
//! - [`archive`] - Zip extraction
//! - [`transcode`] - Legacy-encoded text to keyed JSON dataset
//! - [`ledger`] - Version history and last-version pointer
//! - [`cache`] - In-memory dataset with lookup and search
//! - [`pipeline`] - Run orchestration and the interval scheduler
//! - [`storage`] - File layout and atomic writes
//! - [`config`] - Defaults and the optional config file

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod cache;
pub mod config;
pub mod download;
pub mod ledger;
pub mod pipeline;
pub mod source;
pub mod storage;
#[cfg(test)]
pub mod test_support;
pub mod transcode;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use archive::ArchiveError;
pub use cache::{
    CacheError, CacheStats, DatasetCache, Readiness, RecordPage, ReloadListener, SearchCriteria,
};
pub use config::{ConfigError, FileConfig, Settings, load_settings};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, DownloadFileResult, DownloadRequest, FailureType,
    HttpClient, RetryDecision, RetryPolicy, classify_error,
};
pub use ledger::{
    ExtractMetadata, LedgerDocument, LedgerError, LedgerStats, VersionComparison, VersionLedger,
};
pub use pipeline::{
    Pipeline, PipelineError, RunArtifacts, RunOptions, RunOutcome, RunReport, RunState, Scheduler,
};
pub use source::{DetectError, ExtractSource, SepomexSource, SourceConfig, UpdateCheck};
pub use storage::{ArtifactPresence, StorageLayout};
pub use transcode::{PostalRecord, TranscodeError, TranscodeOptions, Transcoder};
pub use user_agent::BROWSER_USER_AGENT;
