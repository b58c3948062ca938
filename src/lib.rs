//! Clinflow: idempotent clinical measurement ingest with exact incremental
//! daily rollups, powered by Postgres.

pub mod aggregates;
pub mod dimensions;
mod error;
pub mod identity;
pub mod ingest;
pub mod jobs;
pub mod loader;
pub mod measurement;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod status;
pub mod store;
pub mod testing;
pub mod transform;

pub use aggregates::{BucketKey, BucketStats};
pub use error::{Error, Result, WithContext};
pub use ingest::{IngestMode, IngestOutcome};
pub use jobs::{JobRecord, JobStatus, JobTracker, Jobs};
pub use loader::LoadOutcome;
pub use measurement::{LOW_QUALITY_THRESHOLD, Measurement, MeasurementRow, MeasurementType};
pub use merge::MergeOutcome;
pub use pipeline::{CsvFileSource, Pipeline, PipelineConfig, RowSource};
pub use schema::{SchemaConfig, SchemaPlan};
pub use status::{NoopSink, Stage, StatusSink, StatusUpdate};
pub use store::{Store, StoreBuilder};

pub mod prelude {
    pub use crate::{
        IngestMode, MeasurementRow, MeasurementType, NoopSink, Result, StatusSink, Store,
    };
}
