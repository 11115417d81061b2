//! Error types for update detection.

use thiserror::Error;

use crate::download::{DownloadError, FailureType, classify_error};

/// Errors raised while probing the source's landing page.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The page could not be fetched.
    #[error("could not reach source page: {source}")]
    Network {
        /// Underlying transport error.
        #[source]
        source: DownloadError,
    },

    /// The page no longer matches the expected form contract.
    #[error("unexpected page structure at {url}: {reason}")]
    Parse {
        /// Page URL that was probed.
        url: String,
        /// What was missing or malformed.
        reason: String,
    },
}

impl DetectError {
    /// Creates a network error wrapping a transport failure.
    pub fn network(source: DownloadError) -> Self {
        Self::Network { source }
    }

    /// Creates a parse error for `url`.
    pub fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Classifies a detection failure for retry decisions.
///
/// Transport failures follow [`classify_error`]; parse failures are permanent.
#[must_use]
pub fn classify_detect_error(error: &DetectError) -> FailureType {
    match error {
        DetectError::Network { source } => classify_error(source),
        DetectError::Parse { .. } => FailureType::Permanent,
    }
}
