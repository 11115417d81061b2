//! Serialized ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Facts about one ingested extract. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractMetadata {
    /// `YYYYMMDD` version identifier.
    pub version: String,
    /// Publication date as printed by the source.
    #[serde(rename = "fileDate")]
    pub source_file_date: Option<String>,
    #[serde(rename = "downloadDate")]
    pub download_timestamp: DateTime<Utc>,
    /// Size of the downloaded archive.
    #[serde(rename = "fileSize")]
    pub byte_size: u64,
    /// Accepted extract lines.
    #[serde(rename = "recordCount")]
    pub record_count: u64,
    /// Distinct postal codes.
    #[serde(rename = "postalCodeCount")]
    pub unique_key_count: u64,
    /// Name of the renamed extract (`<version>.txt`).
    #[serde(rename = "fileName")]
    pub file_name: String,
}

/// The history document: newest entry first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub versions: Vec<ExtractMetadata>,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl LedgerDocument {
    /// Looks up an entry by version.
    #[must_use]
    pub fn find(&self, version: &str) -> Option<&ExtractMetadata> {
        self.versions.iter().find(|entry| entry.version == version)
    }

    /// Summary of the whole history.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let total_versions = self.versions.len();
        let average_unique_key_count = if total_versions == 0 {
            0
        } else {
            self.versions.iter().map(|v| v.unique_key_count).sum::<u64>() / total_versions as u64
        };
        LedgerStats {
            total_versions,
            first_version: self.versions.last().map(|v| v.version.clone()),
            latest_version: self.versions.first().map(|v| v.version.clone()),
            last_updated: self.last_updated,
            total_record_count: self.versions.iter().map(|v| v.record_count).sum(),
            total_byte_size: self.versions.iter().map(|v| v.byte_size).sum(),
            average_unique_key_count,
        }
    }

    /// Compares the two newest entries; `None` with fewer than two.
    #[must_use]
    pub fn compare_latest(&self) -> Option<VersionComparison> {
        let [newer, older, ..] = self.versions.as_slice() else {
            return None;
        };
        Some(VersionComparison {
            newer: newer.version.clone(),
            older: older.version.clone(),
            record_delta: signed_delta(newer.record_count, older.record_count),
            unique_key_delta: signed_delta(newer.unique_key_count, older.unique_key_count),
            byte_size_delta: signed_delta(newer.byte_size, older.byte_size),
        })
    }
}

fn signed_delta(newer: u64, older: u64) -> i64 {
    let newer = i64::try_from(newer).unwrap_or(i64::MAX);
    let older = i64::try_from(older).unwrap_or(i64::MAX);
    newer.saturating_sub(older)
}

/// Aggregate view of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_versions: usize,
    /// Oldest version on record.
    pub first_version: Option<String>,
    pub latest_version: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub total_record_count: u64,
    pub total_byte_size: u64,
    pub average_unique_key_count: u64,
}

/// Differences between the two newest versions (newer minus older).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub newer: String,
    pub older: String,
    pub record_delta: i64,
    pub unique_key_delta: i64,
    pub byte_size_delta: i64,
}
