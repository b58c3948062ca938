//! Incremental daily rollups.
//!
//! A merge consumes measurement rows that have not been aggregated yet,
//! folds them into per-bucket partials and combines each partial with the
//! stored bucket using [`BucketStats::merge`]. Consumed rows are stamped with
//! `aggregated_at`, which is the watermark that keeps a repeated merge over
//! the same identifiers from counting anything twice.
//!
//! Concurrent merges serialize on row locks: first on the measurement rows
//! (so a row is consumed by exactly one merge), then on the bucket rows, which
//! are created empty if missing and locked in key order before the
//! read-modify-write.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    Result,
    aggregates::{BucketKey, BucketStats, Observation, fold_partials},
    measurement::MeasurementType,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Distinct identifiers supplied by the caller.
    pub requested: usize,
    /// Rows folded into rollups by this merge.
    pub merged_rows: usize,
    /// Buckets created or updated.
    pub buckets: usize,
}

impl MergeOutcome {
    /// Supplied identifiers that were already merged or are not stored.
    pub fn ignored(&self) -> usize {
        self.requested - self.merged_rows
    }
}

#[derive(FromRow)]
struct PendingRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    study_id: String,
    site_id: String,
    participant_id: String,
    measurement_type: String,
    value_num: Option<f64>,
    bp_systolic: Option<f64>,
    bp_diastolic: Option<f64>,
    quality_score: f64,
}

impl PendingRow {
    fn into_observation(self) -> Result<(Uuid, Observation)> {
        let measurement_type = self.measurement_type.parse::<MeasurementType>()?;
        Ok((
            self.id,
            Observation {
                key: BucketKey {
                    day: self.timestamp.date_naive(),
                    study_id: self.study_id,
                    site_id: self.site_id,
                    participant_id: self.participant_id,
                    measurement_type,
                },
                value_num: self.value_num,
                systolic: self.bp_systolic,
                diastolic: self.bp_diastolic,
                quality_score: self.quality_score,
            },
        ))
    }
}

#[derive(FromRow)]
struct BucketRow {
    agg_day: NaiveDate,
    study_id: String,
    site_id: String,
    participant_id: String,
    measurement_type: String,
    measurement_count: i64,
    avg_value: Option<f64>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    avg_systolic: Option<f64>,
    avg_diastolic: Option<f64>,
    avg_quality_score: Option<f64>,
    low_quality_count: i64,
}

impl BucketRow {
    fn split(self) -> Result<(BucketKey, BucketStats)> {
        Ok((
            BucketKey {
                day: self.agg_day,
                study_id: self.study_id,
                site_id: self.site_id,
                participant_id: self.participant_id,
                measurement_type: self.measurement_type.parse()?,
            },
            BucketStats {
                measurement_count: self.measurement_count,
                avg_value: self.avg_value,
                min_value: self.min_value,
                max_value: self.max_value,
                avg_systolic: self.avg_systolic,
                avg_diastolic: self.avg_diastolic,
                avg_quality_score: self.avg_quality_score,
                low_quality_count: self.low_quality_count,
            },
        ))
    }
}

/// Column-wise key arrays for `unnest` binds.
#[derive(Default)]
struct KeyColumns {
    days: Vec<NaiveDate>,
    studies: Vec<String>,
    sites: Vec<String>,
    participants: Vec<String>,
    types: Vec<&'static str>,
}

impl KeyColumns {
    fn from_keys<'a>(keys: impl Iterator<Item = &'a BucketKey>) -> Self {
        let mut cols = KeyColumns::default();
        for k in keys {
            cols.days.push(k.day);
            cols.studies.push(k.study_id.clone());
            cols.sites.push(k.site_id.clone());
            cols.participants.push(k.participant_id.clone());
            cols.types.push(k.measurement_type.as_str());
        }
        cols
    }
}

const BUCKET_COLUMNS: &str = "agg_day, study_id, site_id, participant_id, measurement_type, \
     measurement_count, avg_value, min_value, max_value, avg_systolic, avg_diastolic, \
     avg_quality_score, low_quality_count";

pub struct Aggregations {
    pool: PgPool,
}

impl Aggregations {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Merge the not-yet-aggregated rows among `ids` into their buckets.
    ///
    /// Runs entirely inside `tx`; when `tx` is the transaction that loaded the
    /// rows, load and merge become visible together.
    #[instrument(skip_all, fields(ids = ids.len()))]
    pub async fn merge_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
    ) -> Result<MergeOutcome> {
        let mut requested: Vec<Uuid> = ids.to_vec();
        requested.sort_unstable();
        requested.dedup();
        if requested.is_empty() {
            return Ok(MergeOutcome::default());
        }

        let pending: Vec<PendingRow> = sqlx::query_as(
            r#"
            select id, "timestamp", study_id, site_id, participant_id, measurement_type,
                   value_num, bp_systolic, bp_diastolic, quality_score
            from clinical_measurements
            where id = any($1) and aggregated_at is null
            order by id
            for update
            "#,
        )
        .bind(&requested)
        .fetch_all(&mut **tx)
        .await?;

        if pending.is_empty() {
            debug!(requested = requested.len(), "nothing left to merge");
            return Ok(MergeOutcome {
                requested: requested.len(),
                ..MergeOutcome::default()
            });
        }

        let mut consumed = Vec::with_capacity(pending.len());
        let mut observations = Vec::with_capacity(pending.len());
        for row in pending {
            let (id, obs) = row.into_observation()?;
            consumed.push(id);
            observations.push(obs);
        }
        let partials = fold_partials(&observations);

        let stored = Self::lock_buckets(tx, &partials).await?;
        let merged: BTreeMap<&BucketKey, BucketStats> = partials
            .iter()
            .map(|(key, partial)| {
                let current = stored.get(key).cloned().unwrap_or_default();
                (key, current.merge(partial))
            })
            .collect();
        Self::write_buckets(tx, &merged).await?;

        sqlx::query("update clinical_measurements set aggregated_at = now() where id = any($1)")
            .bind(&consumed)
            .execute(&mut **tx)
            .await?;

        info!(
            merged_rows = consumed.len(),
            buckets = merged.len(),
            "aggregations merged"
        );

        Ok(MergeOutcome {
            requested: requested.len(),
            merged_rows: consumed.len(),
            buckets: merged.len(),
        })
    }

    /// Ensure each bucket row exists, then lock them in key order and return
    /// their current state.
    async fn lock_buckets(
        tx: &mut Transaction<'_, Postgres>,
        partials: &BTreeMap<BucketKey, BucketStats>,
    ) -> Result<BTreeMap<BucketKey, BucketStats>> {
        let cols = KeyColumns::from_keys(partials.keys());

        sqlx::query(
            r#"
            insert into measurement_aggregations
                (agg_day, study_id, site_id, participant_id, measurement_type)
            select * from unnest($1::date[], $2::text[], $3::text[], $4::text[], $5::text[])
            on conflict do nothing
            "#,
        )
        .bind(&cols.days)
        .bind(&cols.studies)
        .bind(&cols.sites)
        .bind(&cols.participants)
        .bind(&cols.types)
        .execute(&mut **tx)
        .await?;

        let rows: Vec<BucketRow> = sqlx::query_as(&format!(
            r#"
            select {columns}
            from measurement_aggregations a
            join unnest($1::date[], $2::text[], $3::text[], $4::text[], $5::text[])
                with ordinality as k(agg_day, study_id, site_id, participant_id, measurement_type, ord)
              using (agg_day, study_id, site_id, participant_id, measurement_type)
            order by k.ord
            for update of a
            "#,
            columns = BUCKET_COLUMNS,
        ))
        .bind(&cols.days)
        .bind(&cols.studies)
        .bind(&cols.sites)
        .bind(&cols.participants)
        .bind(&cols.types)
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter().map(BucketRow::split).collect()
    }

    async fn write_buckets(
        tx: &mut Transaction<'_, Postgres>,
        merged: &BTreeMap<&BucketKey, BucketStats>,
    ) -> Result<()> {
        let cols = KeyColumns::from_keys(merged.keys().copied());
        let stats: Vec<&BucketStats> = merged.values().collect();
        let counts: Vec<i64> = stats.iter().map(|s| s.measurement_count).collect();
        let avg_value: Vec<Option<f64>> = stats.iter().map(|s| s.avg_value).collect();
        let min_value: Vec<Option<f64>> = stats.iter().map(|s| s.min_value).collect();
        let max_value: Vec<Option<f64>> = stats.iter().map(|s| s.max_value).collect();
        let avg_systolic: Vec<Option<f64>> = stats.iter().map(|s| s.avg_systolic).collect();
        let avg_diastolic: Vec<Option<f64>> = stats.iter().map(|s| s.avg_diastolic).collect();
        let avg_quality: Vec<Option<f64>> = stats.iter().map(|s| s.avg_quality_score).collect();
        let low_quality: Vec<i64> = stats.iter().map(|s| s.low_quality_count).collect();

        sqlx::query(
            r#"
            update measurement_aggregations a
               set measurement_count = u.measurement_count,
                   avg_value = u.avg_value,
                   min_value = u.min_value,
                   max_value = u.max_value,
                   avg_systolic = u.avg_systolic,
                   avg_diastolic = u.avg_diastolic,
                   avg_quality_score = u.avg_quality_score,
                   low_quality_count = u.low_quality_count,
                   updated_at = now()
              from unnest(
                    $1::date[], $2::text[], $3::text[], $4::text[], $5::text[],
                    $6::bigint[], $7::float8[], $8::float8[], $9::float8[],
                    $10::float8[], $11::float8[], $12::float8[], $13::bigint[]
                   ) as u(agg_day, study_id, site_id, participant_id, measurement_type,
                          measurement_count, avg_value, min_value, max_value,
                          avg_systolic, avg_diastolic, avg_quality_score, low_quality_count)
             where a.agg_day = u.agg_day
               and a.study_id = u.study_id
               and a.site_id = u.site_id
               and a.participant_id = u.participant_id
               and a.measurement_type = u.measurement_type
            "#,
        )
        .bind(&cols.days)
        .bind(&cols.studies)
        .bind(&cols.sites)
        .bind(&cols.participants)
        .bind(&cols.types)
        .bind(&counts)
        .bind(&avg_value)
        .bind(&min_value)
        .bind(&max_value)
        .bind(&avg_systolic)
        .bind(&avg_diastolic)
        .bind(&avg_quality)
        .bind(&low_quality)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn bucket(&self, key: &BucketKey) -> Result<Option<BucketStats>> {
        let row: Option<BucketRow> = sqlx::query_as(&format!(
            "select {BUCKET_COLUMNS} from measurement_aggregations \
             where agg_day = $1 and study_id = $2 and site_id = $3 \
               and participant_id = $4 and measurement_type = $5"
        ))
        .bind(key.day)
        .bind(&key.study_id)
        .bind(&key.site_id)
        .bind(&key.participant_id)
        .bind(key.measurement_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.split().map(|(_, stats)| stats)).transpose()
    }

    pub async fn buckets_for_study(&self, study_id: &str) -> Result<Vec<(BucketKey, BucketStats)>> {
        let rows: Vec<BucketRow> = sqlx::query_as(&format!(
            "select {BUCKET_COLUMNS} from measurement_aggregations \
             where study_id = $1 \
             order by agg_day, site_id, participant_id, measurement_type"
        ))
        .bind(study_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BucketRow::split).collect()
    }

    /// Identifiers loaded but not yet merged, oldest first.
    ///
    /// This is the recovery path after a crash between load and merge.
    pub async fn pending_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "select id from clinical_measurements where aggregated_at is null order by created_at, id limit $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
