use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::{Result, measurement::Measurement};

/// Existence-only registries (studies, participants, sites) plus the
/// first-seen enrollment table.
///
/// Every write takes the caller's transaction so registration commits or
/// rolls back together with the fact rows that reference it.
pub struct Dimensions {
    pool: PgPool,
}

impl Dimensions {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register_studies(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[String],
    ) -> Result<u64> {
        Self::register_keys(
            tx,
            "insert into studies (study_id) select unnest($1::text[]) on conflict do nothing",
            ids,
        )
        .await
    }

    pub async fn register_participants(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[String],
    ) -> Result<u64> {
        Self::register_keys(
            tx,
            "insert into participants (participant_id) select unnest($1::text[]) on conflict do nothing",
            ids,
        )
        .await
    }

    pub async fn register_sites(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[String],
    ) -> Result<u64> {
        Self::register_keys(
            tx,
            "insert into sites (site_id) select unnest($1::text[]) on conflict do nothing",
            ids,
        )
        .await
    }

    async fn register_keys(
        tx: &mut Transaction<'_, Postgres>,
        sql: &str,
        ids: &[String],
    ) -> Result<u64> {
        let unique: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query(sql).bind(&unique).execute(&mut **tx).await?;
        Ok(res.rows_affected())
    }

    /// Record the earliest timestamp seen per (participant, study).
    ///
    /// The stored value only ever moves backwards: a batch holding only later
    /// readings leaves `enrolled_at` untouched.
    pub async fn register_enrollments(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rows: &[Measurement],
    ) -> Result<u64> {
        let first_seen = first_seen_per_enrollment(rows);
        if first_seen.is_empty() {
            return Ok(0);
        }

        let mut participants = Vec::with_capacity(first_seen.len());
        let mut studies = Vec::with_capacity(first_seen.len());
        let mut enrolled = Vec::with_capacity(first_seen.len());
        for ((participant, study), at) in first_seen {
            participants.push(participant);
            studies.push(study);
            enrolled.push(at);
        }

        let res = sqlx::query(
            r#"
            insert into participant_enrollments (participant_id, study_id, enrolled_at)
            select * from unnest($1::text[], $2::text[], $3::timestamptz[])
            on conflict (participant_id, study_id) do update
              set enrolled_at = least(participant_enrollments.enrolled_at, excluded.enrolled_at)
            "#,
        )
        .bind(&participants)
        .bind(&studies)
        .bind(&enrolled)
        .execute(&mut **tx)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn register_all(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rows: &[Measurement],
    ) -> Result<()> {
        let studies: Vec<String> = rows.iter().map(|m| m.row.study_id.clone()).collect();
        let participants: Vec<String> =
            rows.iter().map(|m| m.row.participant_id.clone()).collect();
        let sites: Vec<String> = rows.iter().map(|m| m.row.site_id.clone()).collect();

        let new_studies = self.register_studies(tx, &studies).await?;
        let new_participants = self.register_participants(tx, &participants).await?;
        let new_sites = self.register_sites(tx, &sites).await?;
        let enrollments = self.register_enrollments(tx, rows).await?;
        debug!(
            new_studies,
            new_participants, new_sites, enrollments, "dimensions registered"
        );
        Ok(())
    }

    pub async fn enrolled_at(
        &self,
        participant_id: &str,
        study_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let at = sqlx::query_scalar(
            "select enrolled_at from participant_enrollments where participant_id = $1 and study_id = $2",
        )
        .bind(participant_id)
        .bind(study_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(at)
    }

    pub async fn study_exists(&self, study_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("select exists (select 1 from studies where study_id = $1)")
                .bind(study_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

pub(crate) fn first_seen_per_enrollment(
    rows: &[Measurement],
) -> BTreeMap<(String, String), DateTime<Utc>> {
    let mut out: BTreeMap<(String, String), DateTime<Utc>> = BTreeMap::new();
    for m in rows {
        let key = (m.row.participant_id.clone(), m.row.study_id.clone());
        out.entry(key)
            .and_modify(|at| *at = (*at).min(m.row.timestamp))
            .or_insert(m.row.timestamp);
    }
    out
}
