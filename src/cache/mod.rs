//! In-memory serving cache for the current dataset.
//!
//! The cache loads the dataset named by the ledger's pointer record and
//! answers lookups from memory. It never reloads on its own: the pipeline
//! calls [`DatasetCache::reload`] (through [`ReloadListener`]) right after a
//! successful append.
//!
//! A reload parses the new dataset without holding the lock and then swaps an
//! `Arc` under a short write lock, so concurrent readers see either the old
//! or the new dataset in full.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{LedgerError, VersionLedger};
use crate::storage::StorageLayout;
use crate::transcode::{Dataset, PostalRecord, normalize_code};

/// Default cap on search results.
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Default page size for [`DatasetCache::all`].
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Errors raised by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No dataset is loaded.
    #[error("postal-code data is not available")]
    DataUnavailable,

    /// The requested code is not in the loaded dataset.
    #[error("postal code '{code}' not found")]
    NotFound {
        /// Code as requested.
        code: String,
    },

    /// The pointer record could not be read.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The dataset file could not be read.
    #[error("cannot read dataset {path}: {source}")]
    Io {
        /// Dataset path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The dataset file is not a valid dataset document.
    #[error("dataset {path} is malformed: {source}")]
    Malformed {
        /// Dataset path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// A dataset installed in the cache.
#[derive(Debug)]
pub struct LoadedDataset {
    pub version: String,
    pub records: Dataset,
    pub loaded_at: DateTime<Utc>,
}

/// Independent optional filters; all present filters must match.
///
/// Matching is case-insensitive substring containment. The neighborhood
/// filter matches when any neighborhood of the record contains it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub state: Option<String>,
    pub city: Option<String>,
    pub municipality: Option<String>,
    pub neighborhood: Option<String>,
}

impl SearchCriteria {
    fn prepared(&self) -> PreparedCriteria {
        let lower = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_lowercase)
        };
        PreparedCriteria {
            state: lower(&self.state),
            city: lower(&self.city),
            municipality: lower(&self.municipality),
            neighborhood: lower(&self.neighborhood),
        }
    }
}

struct PreparedCriteria {
    state: Option<String>,
    city: Option<String>,
    municipality: Option<String>,
    neighborhood: Option<String>,
}

impl PreparedCriteria {
    fn matches(&self, record: &PostalRecord) -> bool {
        let contains = |haystack: &str, needle: &Option<String>| {
            needle
                .as_deref()
                .is_none_or(|needle| haystack.to_lowercase().contains(needle))
        };
        contains(&record.state, &self.state)
            && contains(&record.city, &self.city)
            && contains(&record.municipality, &self.municipality)
            && self.neighborhood.as_deref().is_none_or(|needle| {
                record
                    .neighborhoods
                    .iter()
                    .any(|n| n.to_lowercase().contains(needle))
            })
    }
}

/// One page of records in code order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPage {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub records: Vec<PostalRecord>,
}

/// Summary of the loaded dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub version: String,
    pub total_postal_codes: usize,
    pub total_states: usize,
    pub total_cities: usize,
    pub total_municipalities: usize,
    /// Sum of neighborhood counts over all records.
    pub total_neighborhoods: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Whether a serving process has data to answer with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub version: Option<String>,
    pub reason: Option<String>,
}

/// Receives the pipeline's "new dataset published" signal.
pub trait ReloadListener: Send + Sync {
    /// Called after `version` has been appended to the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the new dataset cannot be installed.
    fn dataset_published(&self, version: &str) -> Result<(), CacheError>;
}

/// Read-mostly cache of the current dataset.
#[derive(Debug)]
pub struct DatasetCache {
    ledger: VersionLedger,
    layout: StorageLayout,
    search_limit: usize,
    current: RwLock<Option<Arc<LoadedDataset>>>,
}

impl DatasetCache {
    /// Creates an empty cache; call [`Self::load`] to populate it.
    #[must_use]
    pub fn new(ledger: VersionLedger, layout: StorageLayout) -> Self {
        Self {
            ledger,
            layout,
            search_limit: DEFAULT_SEARCH_LIMIT,
            current: RwLock::new(None),
        }
    }

    /// Sets the search result cap.
    #[must_use]
    pub fn with_search_limit(mut self, search_limit: usize) -> Self {
        self.search_limit = search_limit;
        self
    }

    /// Loads the dataset named by the pointer record.
    ///
    /// Returns the loaded version, or `None` when the pointer is empty or its
    /// dataset file is missing. In that case, and on error, whatever dataset
    /// was installed before stays installed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the pointer or dataset cannot be read or
    /// parsed.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<Option<String>, CacheError> {
        let Some(pointer) = self.ledger.last_version()? else {
            warn!("no version recorded; cache stays empty");
            return Ok(None);
        };

        let path = self.layout.dataset_path(&pointer.version);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "dataset file missing; cache unchanged");
                return Ok(None);
            }
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let records: Dataset = serde_json::from_slice(&raw)
            .map_err(|source| CacheError::Malformed { path: path.clone(), source })?;
        drop(raw);

        let loaded = Arc::new(LoadedDataset {
            version: pointer.version.clone(),
            records,
            loaded_at: Utc::now(),
        });
        let postal_codes = loaded.records.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(loaded);

        info!(version = %pointer.version, postal_codes, "dataset loaded");
        Ok(Some(pointer.version))
    }

    /// Re-runs [`Self::load`].
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn reload(&self) -> Result<Option<String>, CacheError> {
        debug!("reloading dataset");
        self.load()
    }

    /// Snapshot of the installed dataset.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DataUnavailable`] when nothing is loaded.
    pub fn snapshot(&self) -> Result<Arc<LoadedDataset>, CacheError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CacheError::DataUnavailable)
    }

    /// Version of the installed dataset, if any.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.snapshot().ok().map(|loaded| loaded.version.clone())
    }

    /// Exact lookup after normalizing `code` to five digits.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DataUnavailable`] when nothing is loaded and
    /// [`CacheError::NotFound`] for unknown or malformed codes.
    pub fn lookup(&self, code: &str) -> Result<PostalRecord, CacheError> {
        let loaded = self.snapshot()?;
        normalize_code(code)
            .and_then(|normalized| loaded.records.get(&normalized).cloned())
            .ok_or_else(|| CacheError::NotFound {
                code: code.to_string(),
            })
    }

    /// Scans records in code order, stopping at the search cap.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DataUnavailable`] when nothing is loaded.
    pub fn search(&self, criteria: &SearchCriteria) -> Result<Vec<PostalRecord>, CacheError> {
        let loaded = self.snapshot()?;
        let prepared = criteria.prepared();
        Ok(loaded
            .records
            .values()
            .filter(|record| prepared.matches(record))
            .take(self.search_limit)
            .cloned()
            .collect())
    }

    /// Returns `limit` records starting at `offset`, in code order.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DataUnavailable`] when nothing is loaded.
    pub fn all(&self, limit: usize, offset: usize) -> Result<RecordPage, CacheError> {
        let loaded = self.snapshot()?;
        Ok(RecordPage {
            total: loaded.records.len(),
            limit,
            offset,
            records: loaded
                .records
                .values()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        })
    }

    /// Distinct counts over the installed dataset.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DataUnavailable`] when nothing is loaded.
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let loaded = self.snapshot()?;
        let mut states = HashSet::new();
        let mut cities = HashSet::new();
        let mut municipalities = HashSet::new();
        let mut total_neighborhoods = 0;
        for record in loaded.records.values() {
            states.insert(record.state.as_str());
            cities.insert(record.city.as_str());
            municipalities.insert(record.municipality.as_str());
            total_neighborhoods += record.neighborhoods.len();
        }
        Ok(CacheStats {
            version: loaded.version.clone(),
            total_postal_codes: loaded.records.len(),
            total_states: states.len(),
            total_cities: cities.len(),
            total_municipalities: municipalities.len(),
            total_neighborhoods,
            loaded_at: loaded.loaded_at,
        })
    }

    /// Ready when the pointer names a version whose dataset file exists.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        readiness(&self.ledger, &self.layout)
    }
}

/// Ready when the pointer names a version whose dataset file exists.
#[must_use]
pub fn readiness(ledger: &VersionLedger, layout: &StorageLayout) -> Readiness {
    match ledger.last_version() {
        Ok(Some(pointer)) => {
            let path = layout.dataset_path(&pointer.version);
            if path.is_file() {
                Readiness {
                    ready: true,
                    version: Some(pointer.version),
                    reason: None,
                }
            } else {
                Readiness {
                    ready: false,
                    version: Some(pointer.version),
                    reason: Some(format!("dataset file {} is missing", path.display())),
                }
            }
        }
        Ok(None) => Readiness {
            ready: false,
            version: None,
            reason: Some("no version recorded".to_string()),
        },
        Err(error) => Readiness {
            ready: false,
            version: None,
            reason: Some(error.to_string()),
        },
    }
}

impl ReloadListener for DatasetCache {
    fn dataset_published(&self, version: &str) -> Result<(), CacheError> {
        match self.reload()? {
            Some(loaded) if loaded == version => Ok(()),
            Some(loaded) => {
                warn!(expected = version, loaded = %loaded, "reload installed a different version");
                Ok(())
            }
            None => Err(CacheError::DataUnavailable),
        }
    }
}
