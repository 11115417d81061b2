//! HTTP client wrapper for talking to the source.
//!
//! This module provides the `HttpClient` struct which fetches the landing
//! page and streams the archive to disk, with timeout configuration, a cookie
//! store for the source's server-side session, and structured errors.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, ClientBuilder, Proxy};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// How the archive is requested from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadRequest {
    /// Plain GET of a direct link.
    Get {
        /// Archive URL.
        url: String,
    },
    /// Form submission reproducing the page's download button.
    FormPost {
        /// Form action URL.
        url: String,
        /// Url-encoded form fields, in submission order.
        fields: Vec<(String, String)>,
    },
}

impl DownloadRequest {
    /// Target URL of the request.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Get { url } | Self::FormPost { url, .. } => url,
        }
    }

    /// HTTP method used for the request.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::FormPost { .. } => "POST",
        }
    }
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFileResult {
    /// Final output path.
    pub path: PathBuf,
    /// Bytes written to `path`.
    pub byte_size: u64,
}

/// HTTP client for the source with streaming support.
///
/// Designed to be created once per pipeline and reused for the page probe and
/// the archive download, so both share the cookie store that holds the
/// source's session.
///
/// # Example
///
/// ```no_run
/// use sepomex_core::download::{DownloadRequest, HttpClient};
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let request = DownloadRequest::Get { url: "https://example.com/cp.zip".to_string() };
/// let result = client.download_to_file(&request, Path::new("./downloads/cp.zip")).await?;
/// println!("Downloaded {} bytes", result.byte_size);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    user_agent: Option<String>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts and a fresh cookie store.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes
    /// - Gzip decompression: enabled
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when the client cannot be built.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        Self::with_cookie_jar_and_timeouts(
            Arc::new(Jar::default()),
            connect_timeout_secs,
            read_timeout_secs,
        )
    }

    /// Creates a new HTTP client sharing an existing cookie jar.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when the client cannot be built.
    #[instrument(level = "debug", skip(cookie_jar))]
    pub fn with_cookie_jar_and_timeouts(
        cookie_jar: Arc<Jar>,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = build_client(cookie_jar, connect_timeout_secs, read_timeout_secs)?;
        Ok(Self {
            client,
            user_agent: None,
        })
    }

    /// Overrides the User-Agent header sent on every request.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Fetches `url` with GET and returns the decoded response body.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if the URL is invalid, the request fails, the
    /// server answers with a non-success status, or the body cannot be read.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let request = DownloadRequest::Get {
            url: url.to_string(),
        };
        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::from_request(url, e))?;
        debug!(bytes = body.len(), "page fetched");
        Ok(body)
    }

    /// Performs `request` and streams the response body to `destination`.
    ///
    /// Parent directories are created as needed and an existing file is
    /// overwritten. A partially written file is removed when streaming fails.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The URL is invalid
    /// - The request fails (network error, timeout)
    /// - The server returns an error status (4xx, 5xx)
    /// - Writing to disk fails
    #[must_use = "download result contains the path and size of the archive"]
    #[instrument(skip(self, request), fields(method = request.method(), url = %request.url()))]
    pub async fn download_to_file(
        &self,
        request: &DownloadRequest,
        destination: &Path,
    ) -> Result<DownloadFileResult, DownloadError> {
        debug!("starting download");

        let response = self.send(request).await?;

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            && content_type.to_ascii_lowercase().starts_with("text/html")
        {
            warn!(
                content_type,
                "source answered the download with an HTML page; the archive will likely be unreadable"
            );
        }

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let mut file = File::create(destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;

        let stream_result = stream_to_file(&mut file, response, request.url(), destination).await;
        drop(file);

        let byte_size = match stream_result {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(path = %destination.display(), "cleaning up partial file after error");
                let _ = tokio::fs::remove_file(destination).await;
                return Err(error);
            }
        };

        info!(
            path = %destination.display(),
            bytes = byte_size,
            "download complete"
        );

        Ok(DownloadFileResult {
            path: destination.to_path_buf(),
            byte_size,
        })
    }

    async fn send(&self, request: &DownloadRequest) -> Result<reqwest::Response, DownloadError> {
        let url = request.url();
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut builder = match request {
            DownloadRequest::Get { url } => self.client.get(url),
            DownloadRequest::FormPost { url, fields } => self.client.post(url).form(fields),
        };
        if let Some(ua) = &self.user_agent {
            builder = builder.header(USER_AGENT, ua);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DownloadError::from_request(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        Ok(response)
    }

}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::from_request(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}

fn build_client(
    cookie_jar: Arc<Jar>,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<Client, reqwest::Error> {
    let jar = Arc::clone(&cookie_jar);
    let primary = catch_unwind(AssertUnwindSafe(move || {
        base_client_builder(jar, connect_timeout_secs, read_timeout_secs).build()
    }));
    match primary {
        Ok(result) => result,
        Err(_) => {
            // Some sandboxed environments panic while reading system proxy
            // settings; retry with env proxies only.
            warn!("HTTP client builder panicked while loading system proxy settings; retrying with env-proxy fallback");
            apply_env_proxy_fallback(
                base_client_builder(cookie_jar, connect_timeout_secs, read_timeout_secs)
                    .no_proxy(),
            )
            .build()
        }
    }
}

fn base_client_builder(
    cookie_jar: Arc<Jar>,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(read_timeout_secs))
        .gzip(true)
        .user_agent(user_agent::default_user_agent())
        .cookie_provider(cookie_jar)
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    let names: &[&str] = match scheme {
        "https" => &["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"],
        "http" => &["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"],
        _ => return None,
    };
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header, header_regex, method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_text_returns_body() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/page.aspx"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new();
        let body = client
            .fetch_text(&format!("{}/page.aspx", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_fetch_text_503_is_http_status() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new();
        let result = client.fetch_text(&mock_server.uri()).await;
        match result {
            Err(DownloadError::HttpStatus { status, .. }) => assert_eq!(status, 503),
            other => panic!("Expected HttpStatus error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_text_sends_user_agent_override() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            // the browser UA contains a comma, which `header` would split on
            .and(header_regex("user-agent", r"^Mozilla/5\.0 .*Safari/537\.36$"))
            .respond_with(ResponseTemplate::new(200).set_body_string("browser"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().with_user_agent(user_agent::BROWSER_USER_AGENT);
        let body = client.fetch_text(&mock_server.uri()).await.unwrap();
        assert_eq!(body, "browser");

        let requests = mock_server.received_requests().await.unwrap();
        let sent = requests[0].headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert_eq!(sent, user_agent::BROWSER_USER_AGENT);
    }

    #[tokio::test]
    async fn test_download_get_streams_to_destination() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let content = vec![7u8; 256 * 1024];

        Mock::given(method("GET"))
            .and(path("/cp.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new();
        let request = DownloadRequest::Get {
            url: format!("{}/cp.zip", mock_server.uri()),
        };
        let destination = temp_dir.path().join("nested").join("sepomex-20240105.zip");
        let result = client.download_to_file(&request, &destination).await.unwrap();

        assert_eq!(result.path, destination);
        assert_eq!(result.byte_size, content.len() as u64);
        assert_eq!(std::fs::read(&destination).unwrap(), content);
    }

    #[tokio::test]
    async fn test_download_form_post_sends_fields() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/export.aspx"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("__VIEWSTATE=abc%2B%2F%3D"))
            .and(body_string_contains("rblTipo=txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK zip bytes".to_vec()))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new();
        let request = DownloadRequest::FormPost {
            url: format!("{}/export.aspx", mock_server.uri()),
            fields: vec![
                ("__VIEWSTATE".to_string(), "abc+/=".to_string()),
                ("rblTipo".to_string(), "txt".to_string()),
            ],
        };
        let destination = temp_dir.path().join("archive.zip");
        let result = client.download_to_file(&request, &destination).await.unwrap();

        assert_eq!(result.byte_size, 12);
    }

    #[tokio::test]
    async fn test_download_404_leaves_no_file() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new();
        let request = DownloadRequest::Get {
            url: format!("{}/missing.zip", mock_server.uri()),
        };
        let destination = temp_dir.path().join("missing.zip");
        let result = client.download_to_file(&request, &destination).await;

        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_download_invalid_url() {
        let temp_dir = TempDir::new().unwrap();
        let client = HttpClient::new();
        let request = DownloadRequest::Get {
            url: "not-a-valid-url".to_string(),
        };

        let result = client
            .download_to_file(&request, &temp_dir.path().join("x.zip"))
            .await;

        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[test]
    fn test_download_request_accessors() {
        let get = DownloadRequest::Get {
            url: "https://example.com/a.zip".to_string(),
        };
        let post = DownloadRequest::FormPost {
            url: "https://example.com/form.aspx".to_string(),
            fields: Vec::new(),
        };
        assert_eq!(get.method(), "GET");
        assert_eq!(post.method(), "POST");
        assert_eq!(post.url(), "https://example.com/form.aspx");
    }
}
