//! Error type for a pipeline run.

use thiserror::Error;

use super::RunState;
use crate::archive::ArchiveError;
use crate::cache::CacheError;
use crate::download::DownloadError;
use crate::ledger::LedgerError;
use crate::source::DetectError;
use crate::transcode::TranscodeError;

/// A failed run, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Reading the pointer record before probing failed.
    #[error("cannot read last known version: {0}")]
    Pointer(#[source] LedgerError),

    #[error("update detection failed: {0}")]
    Detect(#[source] DetectError),

    #[error("archive download failed: {0}")]
    Download(#[source] DownloadError),

    #[error("archive extraction failed: {0}")]
    Extract(#[source] ArchiveError),

    #[error("dataset transcoding failed: {0}")]
    Transcode(#[source] TranscodeError),

    #[error("ledger append failed: {0}")]
    Ledger(#[source] LedgerError),

    #[error("cache reload failed: {0}")]
    Reload(#[source] CacheError),

    /// A blocking stage panicked or was cancelled.
    #[error("{stage} task did not complete: {source}")]
    Task {
        /// Stage whose task failed.
        stage: RunState,
        /// Join failure.
        #[source]
        source: tokio::task::JoinError,
    },
}

impl PipelineError {
    /// Stage the run was in when it failed.
    #[must_use]
    pub fn stage(&self) -> RunState {
        match self {
            Self::Pointer(_) | Self::Detect(_) => RunState::Detecting,
            Self::Download(_) => RunState::Downloading,
            Self::Extract(_) => RunState::Extracting,
            Self::Transcode(_) => RunState::Transcoding,
            Self::Ledger(_) => RunState::Ledgering,
            Self::Reload(_) => RunState::ReloadSignaled,
            Self::Task { stage, .. } => *stage,
        }
    }
}
