//! Landing-page parsing: session tokens, publication date, version identifier.
//!
//! The source is a server-rendered form page. Everything needed to request
//! the archive is scraped from its HTML with a handful of static patterns;
//! no DOM is built.

use std::sync::LazyLock;

use chrono::{Days, Months, NaiveDate};
use regex::Regex;

/// Hidden field carrying the serialized page state.
pub const VIEW_STATE_FIELD: &str = "__VIEWSTATE";
/// Hidden field identifying the page class that produced the state.
pub const VIEW_STATE_GENERATOR_FIELD: &str = "__VIEWSTATEGENERATOR";
/// Hidden field carrying the server's event validation token.
pub const EVENT_VALIDATION_FIELD: &str = "__EVENTVALIDATION";

static INPUT_TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?is)<input\b[^>]*>"));
static FORM_TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?is)<form\b[^>]*>"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
});
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<title[^>]*>(.*?)</title>"));
static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<body[^>]*>(.*)</body>"));
static SCRIPT_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?s)<[^>]*>"));
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"\s+"));

/// Publication date patterns, most specific first. `.` stops at line breaks.
static DATE_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        compile_static_regex(r"(?i)actualiz.*?(\d{1,2}/\d{1,2}/\d{4})"),
        compile_static_regex(r"(?i)fecha.*?(\d{1,2}/\d{1,2}/\d{4})"),
        compile_static_regex(r"(\d{1,2}/\d{1,2}/\d{4})"),
    ]
});

fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// Hidden form tokens captured from one page load.
///
/// Valid only for the server session that rendered the page; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// `__VIEWSTATE` value.
    pub view_state: String,
    /// `__VIEWSTATEGENERATOR` value, when the page carries one.
    pub view_state_generator: Option<String>,
    /// `__EVENTVALIDATION` value.
    pub event_validation: String,
}

impl SessionContext {
    /// Captures the session tokens from `html`.
    ///
    /// # Errors
    ///
    /// Returns the name of the first required field that is absent or empty.
    pub fn from_html(html: &str) -> Result<Self, &'static str> {
        let view_state = hidden_input_value(html, VIEW_STATE_FIELD).ok_or(VIEW_STATE_FIELD)?;
        let event_validation =
            hidden_input_value(html, EVENT_VALIDATION_FIELD).ok_or(EVENT_VALIDATION_FIELD)?;
        Ok(Self {
            view_state,
            view_state_generator: hidden_input_value(html, VIEW_STATE_GENERATOR_FIELD),
            event_validation,
        })
    }

    /// Builds the form body that reproduces a click on the download button.
    #[must_use]
    pub fn form_fields(&self, selection: &FormSelection) -> Vec<(String, String)> {
        vec![
            (VIEW_STATE_FIELD.to_string(), self.view_state.clone()),
            (
                VIEW_STATE_GENERATOR_FIELD.to_string(),
                self.view_state_generator.clone().unwrap_or_default(),
            ),
            (
                EVENT_VALIDATION_FIELD.to_string(),
                self.event_validation.clone(),
            ),
            ("cboEdo".to_string(), selection.state_code.clone()),
            ("rblTipo".to_string(), selection.format.clone()),
            ("btnDescarga.x".to_string(), selection.button_x.to_string()),
            ("btnDescarga.y".to_string(), selection.button_y.to_string()),
        ]
    }
}

/// Fixed selection parameters submitted with the download form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSelection {
    /// State filter; `00` selects the whole country.
    pub state_code: String,
    /// Export format; `txt` selects the pipe-delimited text extract.
    pub format: String,
    /// Image-button click coordinates.
    pub button_x: u32,
    pub button_y: u32,
}

impl Default for FormSelection {
    fn default() -> Self {
        Self {
            state_code: "00".to_string(),
            format: "txt".to_string(),
            button_x: 50,
            button_y: 20,
        }
    }
}

/// Facts scraped from one load of the landing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingPage {
    /// Trimmed `<title>` text.
    pub title: Option<String>,
    /// Publication date as printed on the page (`dd/mm/yyyy`).
    pub file_date: Option<String>,
    /// Raw `action` attribute of the first form, if any.
    pub form_action: Option<String>,
    /// Session tokens, or the first missing required field.
    pub session: Result<SessionContext, &'static str>,
}

impl LandingPage {
    /// Parses the landing page HTML.
    #[must_use]
    pub fn parse(html: &str) -> Self {
        Self {
            title: page_title(html),
            file_date: scrape_file_date(&body_text(html)),
            form_action: form_action(html),
            session: SessionContext::from_html(html),
        }
    }
}

/// Returns the `value` of the `<input>` whose `id` or `name` equals `field`.
///
/// Empty values are treated as absent.
#[must_use]
pub fn hidden_input_value(html: &str, field: &str) -> Option<String> {
    INPUT_TAG_RE.find_iter(html).find_map(|tag| {
        let attrs = tag_attributes(tag.as_str());
        let matches = attrs
            .iter()
            .any(|(key, value)| (key == "id" || key == "name") && value == field);
        if !matches {
            return None;
        }
        attrs
            .into_iter()
            .find(|(key, _)| key == "value")
            .map(|(_, value)| decode_entities(&value))
            .filter(|value| !value.is_empty())
    })
}

fn form_action(html: &str) -> Option<String> {
    let tag = FORM_TAG_RE.find(html)?;
    tag_attributes(tag.as_str())
        .into_iter()
        .find(|(key, _)| key == "action")
        .map(|(_, value)| decode_entities(value.trim()))
        .filter(|value| !value.is_empty())
}

fn tag_attributes(tag: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(tag)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
            Some((key, value))
        })
        .collect()
}

/// Returns the page title with whitespace collapsed.
#[must_use]
pub fn page_title(html: &str) -> Option<String> {
    let raw = TITLE_RE.captures(html)?.get(1)?.as_str();
    let title = WHITESPACE_RE
        .replace_all(&decode_entities(raw), " ")
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

/// Visible text of the page body with tags, scripts and styles removed.
///
/// Line structure is preserved so date patterns cannot span lines.
#[must_use]
pub fn body_text(html: &str) -> String {
    let body = BODY_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map_or(html, |m| m.as_str());
    let without_scripts = SCRIPT_STYLE_RE.replace_all(body, " ");
    let without_tags = TAG_RE.replace_all(&without_scripts, " ");
    decode_entities(&without_tags)
}

/// Finds the publication date in page text.
///
/// Tries a date following "actualiz…", then one following "fecha…", then the
/// first date anywhere.
#[must_use]
pub fn scrape_file_date(text: &str) -> Option<String> {
    DATE_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Derives the `YYYYMMDD` version identifier.
///
/// A `dd/mm/yyyy` `file_date` always yields the same version: out-of-range
/// days and months roll over into the following (or preceding) month, so
/// `31/02/2024` becomes `20240302`. Only a missing or non-numeric date falls
/// back to `today`.
#[must_use]
pub fn derive_version(file_date: Option<&str>, today: NaiveDate) -> String {
    file_date
        .and_then(parse_day_month_year)
        .unwrap_or(today)
        .format("%Y%m%d")
        .to_string()
}

fn parse_day_month_year(value: &str) -> Option<NaiveDate> {
    let mut parts = value.trim().split('/');
    let day = parts.next()?.parse::<u32>().ok()?;
    let month = parts.next()?.parse::<u32>().ok()?;
    let year = parts.next()?.parse::<i32>().ok()?;
    if parts.next().is_some() {
        return None;
    }

    // month 0 is December of the previous year, day 0 the last day of the
    // previous month
    let first_of_year = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let first_of_month = match month.checked_sub(1) {
        Some(offset) => first_of_year.checked_add_months(Months::new(offset))?,
        None => first_of_year.checked_sub_months(Months::new(1))?,
    };
    match day.checked_sub(1) {
        Some(offset) => first_of_month.checked_add_days(Days::new(u64::from(offset))),
        None => first_of_month.checked_sub_days(Days::new(1)),
    }
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x2F;", "/")
        .replace("&#47;", "/")
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
