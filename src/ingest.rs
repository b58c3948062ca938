use tracing::{info, instrument, warn};

use crate::{
    Error, Result, Store,
    loader::LoadOutcome,
    measurement::MeasurementRow,
    merge::MergeOutcome,
    metrics,
    status::{Stage, StatusSink, StatusUpdate},
    store::identify_all,
};

/// How load and merge are committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IngestMode {
    /// Dimensions, fact rows and rollups commit in a single transaction.
    #[default]
    Atomic,
    /// Dimensions and fact rows commit first; the merge runs in its own
    /// transaction afterwards. A failed merge leaves the rows loaded and
    /// pending, recoverable through [`Store::merge_aggregations`].
    Staged,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngestOutcome {
    pub load: LoadOutcome,
    pub merge: MergeOutcome,
}

impl Store {
    /// Register dimensions, load the batch and merge its rollups.
    #[instrument(skip_all, fields(rows = rows.len(), mode = ?mode))]
    pub async fn ingest(
        &self,
        rows: Vec<MeasurementRow>,
        mode: IngestMode,
        sink: &dyn StatusSink,
    ) -> Result<IngestOutcome> {
        let measurements = identify_all(rows)?;
        let total = measurements.len();

        let mut tx = self.pool().begin().await?;
        self.dimensions()
            .register_all(&mut tx, &measurements)
            .await?;
        sink.report(StatusUpdate::new(
            Stage::Dimensions,
            60,
            "Dimensions registered",
        ));

        let load = self.loader().load(&mut tx, &measurements).await?;
        sink.report(StatusUpdate::new(
            Stage::Load,
            80,
            format!("Loaded {} rows ({} already present)", total, load.skipped),
        ));

        let merge = match mode {
            IngestMode::Atomic => {
                let merge = self
                    .aggregations()
                    .merge_tx(&mut tx, &load.loaded_ids)
                    .await?;
                tx.commit().await?;
                metrics::record_load(&load);
                metrics::record_merge(&merge);
                merge
            }
            IngestMode::Staged => {
                tx.commit().await?;
                metrics::record_load(&load);
                match self.merge_aggregations(&load.loaded_ids).await {
                    Ok(merge) => merge,
                    Err(err) => {
                        warn!(
                            pending = load.loaded_ids.len(),
                            error = %err,
                            "rows loaded but not aggregated"
                        );
                        return Err(Error::partial("aggregate", err));
                    }
                }
            }
        };
        sink.report(StatusUpdate::new(
            Stage::Aggregate,
            95,
            "Measurement aggregations upserted",
        ));

        info!(
            inserted = load.inserted_ids.len(),
            skipped = load.skipped,
            merged_rows = merge.merged_rows,
            buckets = merge.buckets,
            "batch ingested"
        );
        Ok(IngestOutcome { load, merge })
    }
}
