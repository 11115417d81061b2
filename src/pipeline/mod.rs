//! The ingestion run: detect, download, extract, transcode, append, reload.
//!
//! ```text
//! Idle → Detecting → NoUpdate → Idle
//!                  ↘ Downloading → Extracting → Transcoding → Ledgering → ReloadSignaled → Idle
//! ```
//!
//! Any failure returns the pipeline to `Idle` with a report naming the stage.
//! The ledger is only touched after the dataset file has been written, so a
//! failed run never leaves a partial entry behind.

mod error;
pub mod scheduler;

pub use error::PipelineError;
pub use scheduler::Scheduler;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::archive;
use crate::cache::ReloadListener;
use crate::download::DownloadError;
use crate::ledger::{ExtractMetadata, VersionLedger};
use crate::source::{ExtractSource, UpdateCheck};
use crate::storage::StorageLayout;
use crate::transcode::Transcoder;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Detecting,
    NoUpdate,
    Downloading,
    Extracting,
    Transcoding,
    Ledgering,
    ReloadSignaled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::NoUpdate => "no-update",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Transcoding => "transcoding",
            Self::Ledgering => "ledgering",
            Self::ReloadSignaled => "reload-signaled",
        };
        f.write_str(name)
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Probe and report without downloading.
    pub check_only: bool,
    /// Run every stage even when the published version is already known.
    pub force_download: bool,
}

/// Files produced by an ingesting run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunArtifacts {
    pub archive: PathBuf,
    pub extract: PathBuf,
    pub dataset: PathBuf,
}

/// What a run ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The published version is the last known one.
    NoUpdate { version: String },
    /// Check-only run found a newer publication.
    UpdateAvailable { version: String },
    /// A new version was appended and the reload signal delivered.
    Ingested {
        metadata: ExtractMetadata,
        artifacts: RunArtifacts,
    },
    /// Every stage ran but the ledger already held the version.
    VersionConflict {
        version: String,
        artifacts: RunArtifacts,
    },
    /// The run stopped at `stage`.
    Failed { stage: RunState, reason: String },
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

impl RunReport {
    /// False only for failed runs; a version conflict is not a failure.
    #[must_use]
    pub fn success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed { .. })
    }

    /// Human-readable one-line summary.
    #[must_use]
    pub fn reason(&self) -> String {
        match &self.outcome {
            RunOutcome::NoUpdate { version } => format!("no new version (current {version})"),
            RunOutcome::UpdateAvailable { version } => {
                format!("new version {version} available")
            }
            RunOutcome::Ingested { metadata, .. } => format!(
                "ingested version {} ({} records, {} postal codes)",
                metadata.version, metadata.record_count, metadata.unique_key_count
            ),
            RunOutcome::VersionConflict { version, .. } => {
                format!("version {version} already recorded; ledger unchanged")
            }
            RunOutcome::Failed { stage, reason } => format!("failed while {stage}: {reason}"),
        }
    }
}

/// Drives one source through the ingestion stages.
pub struct Pipeline {
    source: Arc<dyn ExtractSource>,
    ledger: VersionLedger,
    layout: StorageLayout,
    transcoder: Transcoder,
    listener: Option<Arc<dyn ReloadListener>>,
    state: Mutex<RunState>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("layout", &self.layout)
            .field("transcoder", &self.transcoder)
            .field("has_listener", &self.listener.is_some())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(
        source: Arc<dyn ExtractSource>,
        ledger: VersionLedger,
        layout: StorageLayout,
        transcoder: Transcoder,
    ) -> Self {
        Self {
            source,
            ledger,
            layout,
            transcoder,
            listener: None,
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Registers the receiver of the post-append reload signal.
    #[must_use]
    pub fn with_reload_listener(mut self, listener: Arc<dyn ReloadListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn enter(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = %*state, to = %next, "pipeline transition");
        *state = next;
    }

    /// Runs the pipeline once and reports the outcome.
    ///
    /// Failures are reported, not returned; the pipeline is `Idle` afterwards.
    #[instrument(skip(self))]
    pub async fn run(&self, options: RunOptions) -> RunReport {
        let started = Instant::now();
        let outcome = match self.execute(options).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let stage = error.stage();
                error!(stage = %stage, error = %error, "run failed");
                RunOutcome::Failed {
                    stage,
                    reason: error.to_string(),
                }
            }
        };
        self.enter(RunState::Idle);

        let report = RunReport {
            outcome,
            elapsed: started.elapsed(),
        };
        info!(
            success = report.success(),
            elapsed_ms = report.elapsed.as_millis(),
            "{}",
            report.reason()
        );
        report
    }

    async fn execute(&self, options: RunOptions) -> Result<RunOutcome, PipelineError> {
        self.enter(RunState::Detecting);
        let last_known = self.ledger.last_version().map_err(PipelineError::Pointer)?;
        let check = self
            .source
            .check_for_update(last_known.as_ref().map(|m| m.version.as_str()))
            .await
            .map_err(PipelineError::Detect)?;

        if options.check_only {
            let version = check.current_version;
            return Ok(if check.has_update {
                info!(version = %version, "new version available (check only)");
                RunOutcome::UpdateAvailable { version }
            } else {
                RunOutcome::NoUpdate { version }
            });
        }

        if !check.has_update && !options.force_download {
            self.enter(RunState::NoUpdate);
            return Ok(RunOutcome::NoUpdate {
                version: check.current_version,
            });
        }
        if !check.has_update {
            info!(version = %check.current_version, "forcing download of known version");
        }

        self.ingest(&check).await
    }

    async fn ingest(&self, check: &UpdateCheck) -> Result<RunOutcome, PipelineError> {
        let version = check.current_version.clone();

        self.enter(RunState::Downloading);
        self.layout.ensure_dirs().map_err(|e| {
            PipelineError::Download(DownloadError::io(self.layout.downloads_dir(), e))
        })?;
        let archive_path = self.layout.archive_path(&version);
        let downloaded = self
            .source
            .download(check, &archive_path)
            .await
            .map_err(PipelineError::Download)?;

        self.enter(RunState::Extracting);
        let downloads_dir = self.layout.downloads_dir().to_path_buf();
        let extract_version = version.clone();
        let archive_for_task = downloaded.path.clone();
        let extract_path = tokio::task::spawn_blocking(move || {
            let extracted = archive::extract(&archive_for_task, &downloads_dir)?;
            archive::rename_to_version(&extracted, &extract_version)
        })
        .await
        .map_err(|source| PipelineError::Task {
            stage: RunState::Extracting,
            source,
        })?
        .map_err(PipelineError::Extract)?;

        self.enter(RunState::Transcoding);
        let transcoder = self.transcoder;
        let dataset_path = self.layout.dataset_path(&version);
        let text_path = extract_path.clone();
        let transcode_version = version.clone();
        let conversion = tokio::task::spawn_blocking(move || {
            transcoder.convert(&text_path, &transcode_version, &dataset_path)
        })
        .await
        .map_err(|source| PipelineError::Task {
            stage: RunState::Transcoding,
            source,
        })?
        .map_err(PipelineError::Transcode)?;

        self.enter(RunState::Ledgering);
        let artifacts = RunArtifacts {
            archive: downloaded.path,
            extract: extract_path,
            dataset: conversion.dataset_path,
        };
        let file_name = artifacts
            .extract
            .file_name()
            .map_or_else(|| format!("{version}.txt"), |n| n.to_string_lossy().into_owned());
        let metadata = ExtractMetadata {
            version: version.clone(),
            source_file_date: check.file_date.clone(),
            download_timestamp: Utc::now(),
            byte_size: downloaded.byte_size,
            record_count: conversion.record_count,
            unique_key_count: conversion.unique_key_count,
            file_name,
        };
        let ledger = self.ledger.clone();
        let entry = metadata.clone();
        let appended = tokio::task::spawn_blocking(move || ledger.add_version(entry))
            .await
            .map_err(|source| PipelineError::Task {
                stage: RunState::Ledgering,
                source,
            })?
            .map_err(PipelineError::Ledger)?;

        if !appended {
            warn!(version = %version, "version conflict; reload not signaled");
            return Ok(RunOutcome::VersionConflict { version, artifacts });
        }

        self.enter(RunState::ReloadSignaled);
        if let Some(listener) = &self.listener {
            let listener = Arc::clone(listener);
            let published = version.clone();
            tokio::task::spawn_blocking(move || listener.dataset_published(&published))
                .await
                .map_err(|source| PipelineError::Task {
                    stage: RunState::ReloadSignaled,
                    source,
                })?
                .map_err(PipelineError::Reload)?;
        }

        Ok(RunOutcome::Ingested {
            metadata,
            artifacts,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    use crate::cache::{CacheError, DatasetCache};
    use crate::download::DownloadFileResult;
    use crate::source::DetectError;

    pub(crate) const EXTRACT_TEXT: &str = "El Catálogo Nacional de Códigos Postales\n\
        d_codigo|d_asenta|d_tipo_asenta|D_mnpio|d_estado|d_ciudad|d_CP|c_estado|c_oficina|c_CP|c_tipo_asenta|c_mnpio|id_asenta_cpcons|d_zona|c_cve_ciudad\n\
        01000|San Ángel|Colonia|Álvaro Obregón|Ciudad de México|Ciudad de México|01001|09|01001||09|010|0001|Urbano|01\n\
        01000|Tlacopac|Colonia|Álvaro Obregón|Ciudad de México|Ciudad de México|01001|09|01001||09|010|0002|Urbano|01\n\
        20000|Zona Centro|Colonia|Aguascalientes|Aguascalientes|Aguascalientes|20001|01|20001||09|001|0001|Urbano|01\n";

    /// Zip archive bytes with the sample extract encoded as windows-1252.
    pub(crate) fn sample_archive_bytes() -> Vec<u8> {
        let (encoded, _, _) = encoding_rs::WINDOWS_1252.encode(EXTRACT_TEXT);
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("CPdescarga.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&encoded).unwrap();
        writer.finish().unwrap().into_inner()
    }

    /// Source that serves a fixed version and archive from memory.
    pub(crate) struct FakeSource {
        pub version: String,
        pub body: Vec<u8>,
        pub fail_detect: bool,
        pub checks: AtomicUsize,
        pub downloads: AtomicUsize,
        pub download_delay: Duration,
    }

    impl FakeSource {
        pub(crate) fn new(version: &str) -> Self {
            Self {
                version: version.to_string(),
                body: sample_archive_bytes(),
                fail_detect: false,
                checks: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
                download_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ExtractSource for FakeSource {
        async fn check_for_update(
            &self,
            last_known_version: Option<&str>,
        ) -> Result<UpdateCheck, DetectError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.fail_detect {
                return Err(DetectError::parse("fake://page", "hidden field __VIEWSTATE not found"));
            }
            Ok(UpdateCheck {
                has_update: last_known_version != Some(self.version.as_str()),
                current_version: self.version.clone(),
                file_date: Some("05/01/2024".to_string()),
                session: None,
                download_url: "fake://archive".to_string(),
                page_title: None,
            })
        }

        async fn download(
            &self,
            _check: &UpdateCheck,
            destination: &Path,
        ) -> Result<DownloadFileResult, DownloadError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if !self.download_delay.is_zero() {
                tokio::time::sleep(self.download_delay).await;
            }
            std::fs::write(destination, &self.body).map_err(|e| DownloadError::io(destination, e))?;
            Ok(DownloadFileResult {
                path: destination.to_path_buf(),
                byte_size: self.body.len() as u64,
            })
        }
    }

    struct CountingListener {
        calls: AtomicUsize,
    }

    impl ReloadListener for CountingListener {
        fn dataset_published(&self, _version: &str) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn layout(temp: &TempDir) -> StorageLayout {
        StorageLayout::new(temp.path().join("downloads"), temp.path().join("data"))
    }

    fn pipeline_with(source: Arc<FakeSource>, temp: &TempDir) -> Pipeline {
        let layout = layout(temp);
        let ledger = VersionLedger::open(&layout).unwrap();
        Pipeline::new(source, ledger, layout, Transcoder::default())
    }

    // ==================== Ingest Tests ====================

    #[tokio::test]
    async fn test_run_ingests_new_version_and_reloads_cache() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        let ledger = VersionLedger::open(&layout).unwrap();
        let cache = Arc::new(DatasetCache::new(ledger.clone(), layout.clone()));
        let source = Arc::new(FakeSource::new("20240105"));
        let pipeline = Pipeline::new(source, ledger, layout.clone(), Transcoder::default())
            .with_reload_listener(cache.clone());

        let report = pipeline.run(RunOptions::default()).await;

        assert!(report.success(), "{}", report.reason());
        let RunOutcome::Ingested { metadata, artifacts } = report.outcome.clone() else {
            panic!("expected ingest, got {:?}", report.outcome);
        };
        assert_eq!(metadata.version, "20240105");
        assert_eq!(metadata.record_count, 3);
        assert_eq!(metadata.unique_key_count, 2);
        assert_eq!(metadata.file_name, "20240105.txt");
        assert_eq!(metadata.source_file_date.as_deref(), Some("05/01/2024"));
        assert_eq!(artifacts.archive, layout.archive_path("20240105"));
        assert_eq!(artifacts.extract, layout.extract_path("20240105"));
        assert_eq!(artifacts.dataset, layout.dataset_path("20240105"));
        assert!(!layout.downloads_dir().join("CPdescarga.txt").exists());

        assert_eq!(
            pipeline.ledger().last_version().unwrap(),
            Some(metadata.clone())
        );
        assert_eq!(cache.version().as_deref(), Some("20240105"));
        assert_eq!(
            cache.lookup("1000").unwrap().neighborhoods,
            vec!["San Ángel", "Tlacopac"]
        );
        assert_eq!(pipeline.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_second_run_reports_no_update_without_download() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new("20240105"));
        let pipeline = pipeline_with(source.clone(), &temp);

        assert!(pipeline.run(RunOptions::default()).await.success());
        let report = pipeline.run(RunOptions::default()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::NoUpdate {
                version: "20240105".to_string()
            }
        );
        assert_eq!(source.checks.load(Ordering::SeqCst), 2);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.ledger().all_versions().unwrap().versions.len(), 1);
    }

    #[tokio::test]
    async fn test_check_only_never_downloads() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new("20240105"));
        let pipeline = pipeline_with(source.clone(), &temp);

        let report = pipeline
            .run(RunOptions {
                check_only: true,
                force_download: false,
            })
            .await;

        assert_eq!(
            report.outcome,
            RunOutcome::UpdateAvailable {
                version: "20240105".to_string()
            }
        );
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.ledger().last_version().unwrap(), None);
    }

    #[tokio::test]
    async fn test_forced_run_of_known_version_is_conflict_without_reload() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new("20240105"));
        let listener = Arc::new(CountingListener {
            calls: AtomicUsize::new(0),
        });
        let pipeline = pipeline_with(source.clone(), &temp).with_reload_listener(listener.clone());

        assert!(pipeline.run(RunOptions::default()).await.success());
        let history_before = std::fs::read(pipeline.ledger().ledger_path()).unwrap();

        let report = pipeline
            .run(RunOptions {
                check_only: false,
                force_download: true,
            })
            .await;

        assert!(report.success());
        assert!(matches!(report.outcome, RunOutcome::VersionConflict { .. }));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read(pipeline.ledger().ledger_path()).unwrap(),
            history_before
        );
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn test_detect_failure_names_stage() {
        let temp = TempDir::new().unwrap();
        let mut fake = FakeSource::new("20240105");
        fake.fail_detect = true;
        let pipeline = pipeline_with(Arc::new(fake), &temp);

        let report = pipeline.run(RunOptions::default()).await;

        assert!(!report.success());
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed {
                stage: RunState::Detecting,
                ..
            }
        ));
        assert_eq!(pipeline.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_html_instead_of_archive_fails_extraction_without_ledger_entry() {
        let temp = TempDir::new().unwrap();
        let mut fake = FakeSource::new("20240105");
        fake.body = b"<html><body>Sesion expirada</body></html>".to_vec();
        let pipeline = pipeline_with(Arc::new(fake), &temp);

        let report = pipeline.run(RunOptions::default()).await;

        match &report.outcome {
            RunOutcome::Failed { stage, reason } => {
                assert_eq!(*stage, RunState::Extracting);
                assert!(reason.contains("invalid zip archive"), "{reason}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(report.reason().starts_with("failed while extracting"));
        assert_eq!(pipeline.ledger().last_version().unwrap(), None);
        assert!(pipeline.ledger().all_versions().unwrap().versions.is_empty());
        assert!(!pipeline.layout().dataset_path("20240105").exists());
    }

    #[tokio::test]
    async fn test_archive_without_text_fails_extraction() {
        let temp = TempDir::new().unwrap();
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("LEAME.pdf", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"%PDF").unwrap();
        let mut fake = FakeSource::new("20240105");
        fake.body = writer.finish().unwrap().into_inner();
        let pipeline = pipeline_with(Arc::new(fake), &temp);

        let report = pipeline.run(RunOptions::default()).await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Failed {
                stage: RunState::Extracting,
                ..
            }
        ));
    }
}
