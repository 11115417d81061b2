//! Postal records and fixed-position line parsing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Width of a normalized postal code.
pub const CODE_WIDTH: usize = 5;

/// Every distinct postal code of one version, keyed by normalized code.
pub type Dataset = BTreeMap<String, PostalRecord>;

/// One postal code and the neighborhoods that share it.
///
/// Serialized with the field names of the published dataset files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalRecord {
    #[serde(rename = "cp")]
    pub code: String,
    #[serde(rename = "estado")]
    pub state: String,
    #[serde(rename = "municipio")]
    pub municipality: String,
    #[serde(rename = "ciudad")]
    pub city: String,
    /// Unique names in first-seen order.
    #[serde(rename = "colonias")]
    pub neighborhoods: Vec<String>,
}

impl PostalRecord {
    /// Appends `neighborhood` unless already present. Returns whether it was added.
    pub fn add_neighborhood(&mut self, neighborhood: &str) -> bool {
        if self.neighborhoods.iter().any(|n| n == neighborhood) {
            return false;
        }
        self.neighborhoods.push(neighborhood.to_string());
        true
    }
}

/// Normalizes a postal code to five zero-padded digits.
///
/// Returns `None` for empty, non-numeric or over-long input.
///
/// ```
/// use sepomex_core::transcode::normalize_code;
///
/// assert_eq!(normalize_code("1000").as_deref(), Some("01000"));
/// assert_eq!(normalize_code(" 01000 ").as_deref(), Some("01000"));
/// assert_eq!(normalize_code("123456"), None);
/// ```
#[must_use]
pub fn normalize_code(raw: &str) -> Option<String> {
    let digits = raw.trim();
    if digits.is_empty() || digits.len() > CODE_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{digits:0>width$}", width = CODE_WIDTH))
}

/// Ordinal positions of the fields used from each extract line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// Lines with fewer fields are skipped.
    pub min_fields: usize,
    pub code: usize,
    pub neighborhood: usize,
    pub municipality: usize,
    pub state: usize,
    pub city: usize,
}

impl Default for FieldLayout {
    fn default() -> Self {
        Self {
            min_fields: 15,
            code: 0,
            neighborhood: 1,
            municipality: 3,
            state: 4,
            city: 5,
        }
    }
}

/// Fields of one accepted extract line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub code: String,
    pub neighborhood: &'a str,
    pub municipality: &'a str,
    pub state: &'a str,
    /// Already falls back to the municipality when blank.
    pub city: &'a str,
}

impl FieldLayout {
    /// Splits a trimmed line on `|` and picks the fields by position.
    ///
    /// Returns `None` for short lines and lines without a usable code.
    #[must_use]
    pub fn parse_line<'a>(&self, line: &'a str) -> Option<ParsedLine<'a>> {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < self.min_fields {
            return None;
        }
        let field = |index: usize| fields.get(index).copied().unwrap_or_default();

        let code = normalize_code(field(self.code))?;
        let municipality = field(self.municipality);
        let city = match field(self.city) {
            "" => municipality,
            city => city,
        };
        Some(ParsedLine {
            code,
            neighborhood: field(self.neighborhood),
            municipality,
            state: field(self.state),
            city,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LINE: &str = "01000|San Ángel|Colonia|Álvaro Obregón|Ciudad de México|Ciudad de México|01001|09|01001||10|010|0001|Urbano|01";

    #[test]
    fn test_normalize_code_pads_and_rejects() {
        assert_eq!(normalize_code("1000").as_deref(), Some("01000"));
        assert_eq!(normalize_code("01000").as_deref(), Some("01000"));
        assert_eq!(normalize_code("7").as_deref(), Some("00007"));
        assert_eq!(normalize_code(""), None);
        assert_eq!(normalize_code("  "), None);
        assert_eq!(normalize_code("01A00"), None);
        assert_eq!(normalize_code("-1000"), None);
        assert_eq!(normalize_code("100000"), None);
    }

    #[test]
    fn test_parse_line_picks_fixed_positions() {
        let parsed = FieldLayout::default().parse_line(LINE).unwrap();
        assert_eq!(parsed.code, "01000");
        assert_eq!(parsed.neighborhood, "San Ángel");
        assert_eq!(parsed.municipality, "Álvaro Obregón");
        assert_eq!(parsed.state, "Ciudad de México");
        assert_eq!(parsed.city, "Ciudad de México");
    }

    #[test]
    fn test_parse_line_blank_city_falls_back_to_municipality() {
        let line = "20000| Centro |Colonia|Aguascalientes|Aguascalientes| |01|01|20001||01|001|0001|Urbano|01";
        let parsed = FieldLayout::default().parse_line(line).unwrap();
        assert_eq!(parsed.neighborhood, "Centro");
        assert_eq!(parsed.city, "Aguascalientes");
    }

    #[test]
    fn test_parse_line_rejects_short_lines() {
        let short = "01000|Centro|X|Cuauhtémoc|CDMX|Ciudad de México";
        assert_eq!(FieldLayout::default().parse_line(short), None);

        let relaxed = FieldLayout {
            min_fields: 6,
            ..FieldLayout::default()
        };
        let parsed = relaxed.parse_line(short).unwrap();
        assert_eq!(parsed.state, "CDMX");
    }

    #[test]
    fn test_parse_line_rejects_bad_code() {
        let line = LINE.replacen("01000", "ABCDE", 1);
        assert_eq!(FieldLayout::default().parse_line(&line), None);
    }

    #[test]
    fn test_add_neighborhood_suppresses_duplicates() {
        let mut record = PostalRecord {
            code: "01000".to_string(),
            state: "Ciudad de México".to_string(),
            municipality: "Álvaro Obregón".to_string(),
            city: "Ciudad de México".to_string(),
            neighborhoods: Vec::new(),
        };
        assert!(record.add_neighborhood("San Ángel"));
        assert!(record.add_neighborhood("Tlacopac"));
        assert!(!record.add_neighborhood("San Ángel"));
        assert_eq!(record.neighborhoods, vec!["San Ángel", "Tlacopac"]);
    }

    #[test]
    fn test_record_serializes_with_dataset_field_names() {
        let record = PostalRecord {
            code: "01000".to_string(),
            state: "E".to_string(),
            municipality: "M".to_string(),
            city: "C".to_string(),
            neighborhoods: vec!["N".to_string()],
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "cp": "01000",
                "estado": "E",
                "municipio": "M",
                "ciudad": "C",
                "colonias": ["N"],
            })
        );
    }
}
