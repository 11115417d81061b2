//! Shared User-Agent strings for source traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/sepomex-sync";

/// Browser User-Agent sent to the source.
///
/// The legacy export form rejects non-browser clients, so page probes and the
/// form POST present themselves as a desktop browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Default User-Agent identifying the tool.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("sepomex-sync/{version} (+{PROJECT_UA_URL})")
}
