//! Update detection and archive retrieval against the publishing site.
//!
//! # Architecture
//!
//! - [`ExtractSource`] - Async trait the pipeline drives (probe, then download)
//! - [`SepomexSource`] - Implementation for the legacy stateful export form
//! - [`UpdateCheck`] - Result of one probe, carrying the captured session
//! - [`page`] - HTML scraping helpers used by the probe
//!
//! Both operations run under the shared [`RetryPolicy`]; parse failures are
//! never retried.

mod error;
pub mod page;

pub use error::{DetectError, classify_detect_error};
pub use page::{FormSelection, LandingPage, SessionContext, derive_version};

use std::path::Path;

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::download::{
    DownloadError, DownloadFileResult, DownloadRequest, HttpClient, RetryPolicy, classify_error,
    with_retry,
};

/// Public landing page of the national postal-code export.
pub const DEFAULT_SOURCE_URL: &str =
    "https://www.correosdemexico.gob.mx/SSLServicios/ConsultaCP/CodigoPostal_Exportar.aspx";

/// Outcome of probing the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    /// True when no version is known yet or the published one differs.
    pub has_update: bool,
    /// Version identifier derived from the page (`YYYYMMDD`).
    pub current_version: String,
    /// Publication date as printed on the page.
    pub file_date: Option<String>,
    /// Session tokens for the stateful POST; `None` means download with GET.
    pub session: Option<SessionContext>,
    /// Where the archive request goes.
    pub download_url: String,
    /// Page title, for reporting.
    pub page_title: Option<String>,
}

impl UpdateCheck {
    /// Builds the archive request this probe allows.
    #[must_use]
    pub fn download_request(&self, selection: &FormSelection) -> DownloadRequest {
        match &self.session {
            Some(session) => DownloadRequest::FormPost {
                url: self.download_url.clone(),
                fields: session.form_fields(selection),
            },
            None => DownloadRequest::Get {
                url: self.download_url.clone(),
            },
        }
    }
}

/// A publisher of the postal-code extract.
///
/// This trait uses `async_trait` so the pipeline can hold a
/// `Box<dyn ExtractSource>` and tests can substitute a local fake.
#[async_trait]
pub trait ExtractSource: Send + Sync {
    /// Probes the source and compares against `last_known_version`.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::Network`] when the page cannot be fetched after
    /// retries, or [`DetectError::Parse`] when the form contract is broken.
    async fn check_for_update(
        &self,
        last_known_version: Option<&str>,
    ) -> Result<UpdateCheck, DetectError>;

    /// Downloads the archive described by `check` to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the transfer fails after retries or the
    /// destination cannot be written.
    async fn download(
        &self,
        check: &UpdateCheck,
        destination: &Path,
    ) -> Result<DownloadFileResult, DownloadError>;
}

/// Settings for [`SepomexSource`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Landing page URL.
    pub page_url: String,
    /// Fail detection when the session tokens are missing instead of
    /// falling back to a plain GET.
    pub strict_tokens: bool,
    /// Selection submitted with the download form.
    pub selection: FormSelection,
    /// Retry policy shared by probe and download.
    pub retry: RetryPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            page_url: DEFAULT_SOURCE_URL.to_string(),
            strict_tokens: true,
            selection: FormSelection::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// The legacy export form at [`DEFAULT_SOURCE_URL`] (or a configured mirror).
#[derive(Debug, Clone)]
pub struct SepomexSource {
    client: HttpClient,
    config: SourceConfig,
}

impl SepomexSource {
    /// Creates a source that talks through `client`.
    ///
    /// The client must keep cookies between calls: the form POST is only
    /// accepted within the session that rendered the page.
    #[must_use]
    pub fn new(client: HttpClient, config: SourceConfig) -> Self {
        Self { client, config }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn interpret_page(
        &self,
        html: &str,
        last_known_version: Option<&str>,
    ) -> Result<UpdateCheck, DetectError> {
        let page_url = &self.config.page_url;
        let page = LandingPage::parse(html);

        let session = match page.session {
            Ok(session) => {
                debug!("session tokens captured");
                Some(session)
            }
            Err(missing) if self.config.strict_tokens => {
                return Err(DetectError::parse(
                    page_url,
                    format!("hidden field {missing} not found"),
                ));
            }
            Err(missing) => {
                warn!(field = missing, "session token missing; archive will be requested with GET");
                None
            }
        };

        let download_url = resolve_action(page_url, page.form_action.as_deref());
        let today = Local::now().date_naive();
        if page.file_date.is_none() {
            warn!("no publication date on page; version falls back to today");
        }
        let current_version = derive_version(page.file_date.as_deref(), today);
        let has_update = last_known_version.is_none_or(|known| known != current_version);

        Ok(UpdateCheck {
            has_update,
            current_version,
            file_date: page.file_date,
            session,
            download_url,
            page_title: page.title,
        })
    }
}

/// Resolves a form `action` against the page URL; the page itself when absent.
fn resolve_action(page_url: &str, action: Option<&str>) -> String {
    action
        .and_then(|action| Url::parse(page_url).ok()?.join(action).ok())
        .map_or_else(|| page_url.to_string(), String::from)
}

#[async_trait]
impl ExtractSource for SepomexSource {
    #[instrument(skip(self), fields(url = %self.config.page_url))]
    async fn check_for_update(
        &self,
        last_known_version: Option<&str>,
    ) -> Result<UpdateCheck, DetectError> {
        let check = with_retry(
            &self.config.retry,
            "source page probe",
            classify_detect_error,
            || async move {
                let html = self
                    .client
                    .fetch_text(&self.config.page_url)
                    .await
                    .map_err(DetectError::network)?;
                self.interpret_page(&html, last_known_version)
            },
        )
        .await?;

        info!(
            current_version = %check.current_version,
            file_date = check.file_date.as_deref().unwrap_or("unknown"),
            has_update = check.has_update,
            "source probed"
        );
        Ok(check)
    }

    #[instrument(skip(self, check), fields(version = %check.current_version))]
    async fn download(
        &self,
        check: &UpdateCheck,
        destination: &Path,
    ) -> Result<DownloadFileResult, DownloadError> {
        let request = check.download_request(&self.config.selection);
        info!(
            method = request.method(),
            url = %request.url(),
            destination = %destination.display(),
            "requesting archive"
        );
        with_retry(&self.config.retry, "archive download", classify_error, || {
            self.client.download_to_file(&request, destination)
        })
        .await
    }
}
