//! HTTP transport for the source: page fetches and streaming archive downloads.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for large archives)
//! - GET and form-POST download requests over a shared cookie store
//! - Configurable timeouts (30s connect, 5min read by default)
//! - Structured error types with full context
//! - Exponential backoff with transient/permanent failure classification
//!
//! # Example
//!
//! ```no_run
//! use sepomex_core::download::{DownloadRequest, HttpClient};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let request = DownloadRequest::Get { url: "https://example.com/cp.zip".to_string() };
//! let result = client
//!     .download_to_file(&request, Path::new("./downloads/sepomex-20240105.zip"))
//!     .await?;
//! println!("Downloaded: {}", result.path.display());
//! # Ok(())
//! # }
//! ```

mod client;
pub(crate) mod constants;
mod error;
mod retry;

pub use client::{DownloadFileResult, DownloadRequest, HttpClient};
pub use error::DownloadError;
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, FailureType, RetryDecision,
    RetryPolicy, classify_error, with_retry,
};

// Use `Result<T, DownloadError>` explicitly in function signatures; no
// module-local Result alias.
