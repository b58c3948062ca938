//! Extract → transform → validate → ingest, reported against one job.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{error, info, instrument};

use crate::{
    Error, Result, Store,
    ingest::{IngestMode, IngestOutcome},
    jobs::JobTracker,
    metrics,
    status::{Stage, StatusSink, StatusUpdate},
    transform::{self, RawRecord, normalize_header},
};

/// Where pipeline input comes from.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn extract(&self, filename: &str) -> Result<Vec<RawRecord>>;
}

/// Reads `<data_dir>/<filename>` as CSV with a header row.
#[derive(Clone, Debug)]
pub struct CsvFileSource {
    data_dir: PathBuf,
}

impl CsvFileSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[async_trait]
impl RowSource for CsvFileSource {
    async fn extract(&self, filename: &str) -> Result<Vec<RawRecord>> {
        let path = self.data_dir.join(filename);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("file not found: {}", path.display()),
                )));
            }
            Err(err) => return Err(err.into()),
        };
        parse_csv(&bytes)
    }
}

/// Header names are normalized before rows are mapped onto [`RawRecord`];
/// unknown columns are ignored.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(bytes);
    let headers: csv::StringRecord = reader.headers()?.iter().map(normalize_header).collect();
    reader.set_headers(headers);
    reader
        .deserialize::<RawRecord>()
        .map(|rec| rec.map_err(Error::from))
        .collect()
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub ingest_mode: IngestMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            ingest_mode: IngestMode::default(),
        }
    }
}

pub struct Pipeline {
    store: Store,
    source: Arc<dyn RowSource>,
    config: PipelineConfig,
}

impl Pipeline {
    /// A pipeline reading CSV files from `config.data_dir`.
    pub fn new(store: Store, config: PipelineConfig) -> Self {
        let source = Arc::new(CsvFileSource::new(config.data_dir.clone()));
        Self {
            store,
            source,
            config,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RowSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the job to completion, recording progress on its `etl_jobs` row.
    ///
    /// The job row must exist (see [`crate::jobs::Jobs::create`]). Status
    /// writes are flushed before this returns.
    #[instrument(skip(self), fields(mode = ?self.config.ingest_mode))]
    pub async fn run(&self, job_id: &str, filename: &str) -> Result<IngestOutcome> {
        let (tracker, writer) = JobTracker::spawn(self.store.jobs(), job_id);
        tracker.running(0, "Job processing started");

        let result = self.execute(filename, &tracker).await;
        match &result {
            Ok(outcome) => {
                tracker.complete("Job completed successfully");
                info!(
                    inserted = outcome.load.inserted_ids.len(),
                    buckets = outcome.merge.buckets,
                    "pipeline finished"
                );
            }
            Err(err) => {
                error!(error = %err, "pipeline failed");
                tracker.fail(err.to_string());
            }
        }
        metrics::record_job(result.is_ok());

        drop(tracker);
        if let Err(err) = writer.await {
            error!(error = %err, "job status writer panicked");
        }
        result
    }

    async fn execute(&self, filename: &str, sink: &dyn StatusSink) -> Result<IngestOutcome> {
        let records = self.source.extract(filename).await?;
        sink.report(StatusUpdate::new(
            Stage::Extract,
            10,
            format!("Extracted {} rows", records.len()),
        ));

        let cleaned = transform::transform(records)?;
        sink.report(StatusUpdate::new(Stage::Transform, 30, "Data transformed"));

        let rows = transform::validate(cleaned)?;
        sink.report(StatusUpdate::new(Stage::Validate, 50, "Data validated"));

        self.store
            .ingest(rows, self.config.ingest_mode, sink)
            .await
    }
}
