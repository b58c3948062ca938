use std::collections::{HashMap, HashSet, hash_map::Entry};

use chrono::SecondsFormat;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    measurement::{Measurement, MeasurementRow},
};

const FACT_COLUMNS: &str = r#"id, study_id, participant_id, measurement_type, value, value_num, bp_systolic, bp_diastolic, unit, "timestamp", site_id, quality_score, processed_at"#;

/// Result of persisting one batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadOutcome {
    /// Every distinct identifier in the batch, in input order, including rows
    /// that were already stored.
    pub loaded_ids: Vec<Uuid>,
    /// Identifiers written by this call.
    pub inserted_ids: Vec<Uuid>,
    /// Rows skipped because their identifier already existed.
    pub skipped: usize,
}

/// Insert-or-ignore writer for `clinical_measurements`.
pub struct BulkLoader {
    pool: PgPool,
}

impl BulkLoader {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stream the batch through a transaction-scoped staging table and move it
    /// into the fact table, ignoring identifiers that are already present.
    ///
    /// Nothing is visible until the caller commits `tx`. A row that breaks a
    /// column constraint fails the whole statement and therefore the batch.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn load(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rows: &[Measurement],
    ) -> Result<LoadOutcome> {
        if rows.is_empty() {
            return Ok(LoadOutcome::default());
        }
        check_batch_collisions(rows)?;

        sqlx::query(
            "create temp table if not exists clinical_measurements_stage (like clinical_measurements including defaults) on commit drop",
        )
        .execute(&mut **tx)
        .await?;
        sqlx::query("truncate clinical_measurements_stage")
            .execute(&mut **tx)
            .await?;

        let payload = encode_copy_rows(rows)?;
        let mut copy = tx
            .copy_in_raw(&format!(
                "copy clinical_measurements_stage ({FACT_COLUMNS}) from stdin with (format csv)"
            ))
            .await?;
        copy.send(payload).await?;
        let staged = copy.finish().await?;

        let inserted_ids: Vec<Uuid> = sqlx::query_scalar(&format!(
            "insert into clinical_measurements ({FACT_COLUMNS}) \
             select {FACT_COLUMNS} from clinical_measurements_stage order by id \
             on conflict (id) do nothing \
             returning id"
        ))
        .fetch_all(&mut **tx)
        .await?;

        let loaded_ids = distinct_in_order(rows.iter().map(|m| m.id));
        let skipped = loaded_ids.len() - inserted_ids.len();
        if skipped > 0 {
            Self::check_skipped_content(tx).await?;
            warn!(skipped, "identifiers already stored; rows ignored");
        }

        debug!(staged, inserted = inserted_ids.len(), "fact rows written");

        Ok(LoadOutcome {
            loaded_ids,
            inserted_ids,
            skipped,
        })
    }

    /// An existing identifier must carry the same business key as the staged
    /// row; anything else means two different rows hashed to one id.
    async fn check_skipped_content(tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        let clash: Option<Uuid> = sqlx::query_scalar(
            r#"
            select s.id
            from clinical_measurements_stage s
            join clinical_measurements m on m.id = s.id
            where (m.study_id, m.participant_id, m.measurement_type, m.value, m."timestamp")
                is distinct from (s.study_id, s.participant_id, s.measurement_type, s.value, s."timestamp")
            limit 1
            "#,
        )
        .fetch_optional(&mut **tx)
        .await?;

        match clash {
            Some(id) => Err(Error::ConstraintViolation {
                constraint: "clinical_measurements_pkey".to_string(),
                detail: format!("identifier {id} is already stored with different content"),
            }),
            None => Ok(()),
        }
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("select count(*) from clinical_measurements")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("select exists (select 1 from clinical_measurements where id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

/// Two rows in one batch may only share an identifier when they carry the
/// same business key; otherwise one of them would vanish in the insert.
pub(crate) fn check_batch_collisions(rows: &[Measurement]) -> Result<()> {
    let mut seen: HashMap<Uuid, &MeasurementRow> = HashMap::with_capacity(rows.len());
    for m in rows {
        match seen.entry(m.id) {
            Entry::Vacant(slot) => {
                slot.insert(&m.row);
            }
            Entry::Occupied(first) if !same_business_key(first.get(), &m.row) => {
                return Err(Error::ConstraintViolation {
                    constraint: "clinical_measurements_pkey".to_string(),
                    detail: format!("identifier {} is shared by rows with different content", m.id),
                });
            }
            Entry::Occupied(_) => {}
        }
    }
    Ok(())
}

fn same_business_key(a: &MeasurementRow, b: &MeasurementRow) -> bool {
    a.study_id == b.study_id
        && a.participant_id == b.participant_id
        && a.timestamp == b.timestamp
        && a.measurement_type == b.measurement_type
        && a.value == b.value
}

fn distinct_in_order(ids: impl Iterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

fn opt_num(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// CSV payload for `COPY … (format csv)`; an unquoted empty field is NULL.
pub(crate) fn encode_copy_rows(rows: &[Measurement]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(rows.len() * 160));
    for m in rows {
        writer.write_record([
            m.id.to_string(),
            m.row.study_id.clone(),
            m.row.participant_id.clone(),
            m.row.measurement_type.as_str().to_string(),
            m.row.value.clone(),
            opt_num(m.reading.value_num()),
            opt_num(m.reading.systolic()),
            opt_num(m.reading.diastolic()),
            m.row.unit.clone().unwrap_or_default(),
            m.row.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            m.row.site_id.clone(),
            m.row.quality_score.to_string(),
            m.processed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{measurement::MeasurementType, testing::row};
    use chrono::{TimeZone, Utc};

    #[test]
    fn copy_payload_leaves_absent_columns_null() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let m = row("S1", "P1", MeasurementType::BloodPressure, "120/80", at, 0.9)
            .identify(at)
            .unwrap();
        let text = String::from_utf8(encode_copy_rows(std::slice::from_ref(&m)).unwrap()).unwrap();
        let expected = format!(
            "{},S1,P1,blood_pressure,120/80,,120,80,mg/dL,2024-01-01T10:00:00.000000Z,SITE1,0.9,2024-01-01T10:00:00.000000Z\n",
            m.id
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn copy_payload_quotes_embedded_commas() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let mut r = row("S1", "P1", MeasurementType::Glucose, "100", at, 1.0);
        r.site_id = "North, Wing".into();
        let m = r.identify(at).unwrap();
        let text = String::from_utf8(encode_copy_rows(&[m]).unwrap()).unwrap();
        assert!(text.contains(",\"North, Wing\","));
    }

    #[test]
    fn separator_collision_in_one_batch_is_rejected() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let a = row("S|1", "P", MeasurementType::Glucose, "100", at, 0.9)
            .identify(at)
            .unwrap();
        let b = row("S", "1|P", MeasurementType::Glucose, "100", at, 0.9)
            .identify(at)
            .unwrap();
        assert_eq!(a.id, b.id);

        let err = check_batch_collisions(&[a, b]).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }), "{err:?}");
    }

    #[test]
    fn exact_duplicates_in_one_batch_are_accepted() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let m = row("S1", "P1", MeasurementType::Glucose, "100", at, 0.9)
            .identify(at)
            .unwrap();
        check_batch_collisions(&[m.clone(), m]).unwrap();
    }

    #[test]
    fn duplicates_collapse_in_input_order() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert_eq!(distinct_in_order([b, a, b, a].into_iter()), vec![b, a]);
    }
}
