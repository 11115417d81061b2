//! Runtime settings: built-in defaults, optionally overlaid by a
//! `key = value` file at `$XDG_CONFIG_HOME/sepomex-sync/config.toml`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::cache::DEFAULT_SEARCH_LIMIT;
use crate::download::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, HttpClient, RetryPolicy,
};
use crate::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use crate::pipeline::scheduler::DEFAULT_INTERVAL;
use crate::source::{DEFAULT_SOURCE_URL, SourceConfig};
use crate::storage::{DEFAULT_DATA_DIR, DEFAULT_DOWNLOADS_DIR, StorageLayout};
use crate::transcode::{DEFAULT_ENCODING_LABEL, TextEncoding, TranscodeOptions};
use crate::user_agent::BROWSER_USER_AGENT;

/// Directory name under the user config root.
pub const CONFIG_DIR_NAME: &str = "sepomex-sync";

/// Errors raised while loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax on line {line}: expected key = value")]
    Syntax { line: usize },

    #[error("unknown configuration key '{key}' on line {line}")]
    UnknownKey { key: String, line: usize },

    #[error("invalid `{key}` value on line {line}: {reason}")]
    InvalidValue {
        key: &'static str,
        line: usize,
        reason: String,
    },

    #[error("invalid config value for `{key}`: {value}. Expected range: {expected}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        expected: &'static str,
    },

    #[error("unsupported text encoding `{label}`")]
    Encoding { label: String },

    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ConfigError {
    fn invalid(key: &'static str, line: usize, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            line,
            reason: reason.into(),
        }
    }
}

/// Values read from a config file; unset keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub source_url: Option<String>,
    pub downloads_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub max_retries: Option<u64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    /// Label understood by the WHATWG encoding registry.
    pub encoding: Option<String>,
    pub schedule_interval_secs: Option<u64>,
    pub search_limit: Option<u64>,
    pub strict_tokens: Option<bool>,
}

impl FileConfig {
    /// Checks numeric ranges and the encoding label.
    ///
    /// # Errors
    ///
    /// Returns the first value outside its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600, "1..=3600")?;
        check_range("read_timeout_secs", self.read_timeout_secs, 1, 3600, "1..=3600")?;
        check_range("max_retries", self.max_retries, 0, 20, "0..=20")?;
        check_range("base_delay_ms", self.base_delay_ms, 0, 600_000, "0..=600000")?;
        check_range("max_delay_ms", self.max_delay_ms, 1, 3_600_000, "1..=3600000")?;
        check_range(
            "schedule_interval_secs",
            self.schedule_interval_secs,
            60,
            31_536_000,
            "60..=31536000",
        )?;
        check_range("search_limit", self.search_limit, 1, 10_000, "1..=10000")?;
        if let Some(label) = &self.encoding {
            TextEncoding::from_label(label).map_err(|_| ConfigError::Encoding {
                label: label.clone(),
            })?;
        }
        Ok(())
    }
}

fn check_range(
    key: &'static str,
    value: Option<u64>,
    min: u64,
    max: u64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    match value {
        Some(value) if !(min..=max).contains(&value) => Err(ConfigError::OutOfRange {
            key,
            value,
            expected,
        }),
        _ => Ok(()),
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source_url: String,
    pub downloads_dir: PathBuf,
    pub data_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub encoding: String,
    pub schedule_interval: Duration,
    pub search_limit: usize,
    pub strict_tokens: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            encoding: DEFAULT_ENCODING_LABEL.to_string(),
            schedule_interval: DEFAULT_INTERVAL,
            search_limit: DEFAULT_SEARCH_LIMIT,
            strict_tokens: true,
        }
    }
}

impl Settings {
    /// Defaults overlaid with whatever the file sets.
    #[must_use]
    pub fn from_file(file: Option<&FileConfig>) -> Self {
        let mut settings = Self::default();
        let Some(file) = file else {
            return settings;
        };

        if let Some(url) = &file.source_url {
            settings.source_url.clone_from(url);
        }
        if let Some(dir) = &file.downloads_dir {
            settings.downloads_dir.clone_from(dir);
        }
        if let Some(dir) = &file.data_dir {
            settings.data_dir.clone_from(dir);
        }
        if let Some(secs) = file.connect_timeout_secs {
            settings.connect_timeout_secs = secs;
        }
        if let Some(secs) = file.read_timeout_secs {
            settings.read_timeout_secs = secs;
        }
        if let Some(retries) = file.max_retries {
            settings.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(ms) = file.base_delay_ms {
            settings.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.max_delay_ms {
            settings.max_delay = Duration::from_millis(ms);
        }
        if let Some(label) = &file.encoding {
            settings.encoding.clone_from(label);
        }
        if let Some(secs) = file.schedule_interval_secs {
            settings.schedule_interval = Duration::from_secs(secs);
        }
        if let Some(limit) = file.search_limit {
            settings.search_limit = usize::try_from(limit).unwrap_or(DEFAULT_SEARCH_LIMIT);
        }
        if let Some(strict) = file.strict_tokens {
            settings.strict_tokens = strict;
        }
        settings
    }

    #[must_use]
    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::new(&self.downloads_dir, &self.data_dir)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay, self.max_delay)
    }

    #[must_use]
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            page_url: self.source_url.clone(),
            strict_tokens: self.strict_tokens,
            retry: self.retry_policy(),
            ..SourceConfig::default()
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Encoding`] for an unknown encoding label.
    pub fn transcode_options(&self) -> Result<TranscodeOptions, ConfigError> {
        let encoding =
            TextEncoding::from_label(&self.encoding).map_err(|_| ConfigError::Encoding {
                label: self.encoding.clone(),
            })?;
        Ok(TranscodeOptions {
            encoding,
            ..TranscodeOptions::default()
        })
    }

    /// HTTP client with the configured timeouts and a browser User-Agent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Client`] when reqwest rejects the configuration.
    pub fn http_client(&self) -> Result<HttpClient, ConfigError> {
        let client = HttpClient::with_timeouts(self.connect_timeout_secs, self.read_timeout_secs)
            .map_err(ConfigError::Client)?;
        Ok(client.with_user_agent(BROWSER_USER_AGENT))
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/sepomex-sync/config.toml`
/// 2. `$HOME/.config/sepomex-sync/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(CONFIG_DIR_NAME).join("config.toml"));
    }
    let home = env_var_non_empty("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join("config.toml"),
    )
}

fn env_var_non_empty(name: &str) -> Option<std::ffi::OsString> {
    env::var_os(name).filter(|value| !value.is_empty())
}

/// Loads settings from `explicit` when given, else from the default path if
/// a file exists there.
///
/// An explicit path that does not exist is an error; a missing default file
/// is not.
///
/// # Errors
///
/// Returns read, syntax and validation errors.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|path| path.exists()),
    };
    let Some(path) = path else {
        debug!("no config file; using defaults");
        return Ok(Settings::default());
    };

    let file = load_file_config(&path)?;
    debug!(path = %path.display(), "config file loaded");
    Ok(Settings::from_file(Some(&file)))
}

/// Reads and parses one config file.
///
/// # Errors
///
/// Returns read, syntax and validation errors.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&raw)
}

/// Parses `key = value` lines with `#` comments.
///
/// # Errors
///
/// Returns syntax, unknown-key and validation errors.
pub fn parse_config_str(raw: &str) -> Result<FileConfig, ConfigError> {
    let mut cfg = FileConfig::default();
    for (index, raw_line) in raw.lines().enumerate() {
        let line = index + 1;
        let content = strip_inline_comment(raw_line).trim();
        if content.is_empty() {
            continue;
        }
        let Some((raw_key, raw_value)) = content.split_once('=') else {
            return Err(ConfigError::Syntax { line });
        };
        let value = raw_value.trim();

        match raw_key.trim() {
            "source_url" => cfg.source_url = Some(parse_string("source_url", value, line)?),
            "downloads_dir" => {
                cfg.downloads_dir = Some(parse_string("downloads_dir", value, line)?.into());
            }
            "data_dir" => cfg.data_dir = Some(parse_string("data_dir", value, line)?.into()),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_u64("connect_timeout_secs", value, line)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_u64("read_timeout_secs", value, line)?);
            }
            "max_retries" => cfg.max_retries = Some(parse_u64("max_retries", value, line)?),
            "base_delay_ms" => cfg.base_delay_ms = Some(parse_u64("base_delay_ms", value, line)?),
            "max_delay_ms" => cfg.max_delay_ms = Some(parse_u64("max_delay_ms", value, line)?),
            "encoding" => cfg.encoding = Some(parse_string("encoding", value, line)?),
            "schedule_interval_secs" => {
                cfg.schedule_interval_secs =
                    Some(parse_u64("schedule_interval_secs", value, line)?);
            }
            "search_limit" => cfg.search_limit = Some(parse_u64("search_limit", value, line)?),
            "strict_tokens" => cfg.strict_tokens = Some(parse_bool("strict_tokens", value, line)?),
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                    line,
                });
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string(key: &'static str, value: &str, line: usize) -> Result<String, ConfigError> {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .map(str::to_string)
        .ok_or_else(|| ConfigError::invalid(key, line, "expected double-quoted string"))
}

fn parse_u64(key: &'static str, value: &str, line: usize) -> Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|e| ConfigError::invalid(key, line, e.to_string()))
}

fn parse_bool(key: &'static str, value: &str, line: usize) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::invalid(key, line, "expected 'true' or 'false'")),
    }
}
