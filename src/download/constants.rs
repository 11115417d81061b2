//! Constants for the download module (timeouts).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes, the archive is tens of megabytes).
pub const READ_TIMEOUT_SECS: u64 = 300;
