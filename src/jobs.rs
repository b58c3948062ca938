use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    Error, Result,
    status::{StatusSink, StatusUpdate},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(rename = "jobId")]
    pub id: String,
    pub filename: String,
    pub study_id: Option<String>,
    pub status: String,
    pub progress: i32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}

/// Persisted job table (`etl_jobs`).
#[derive(Clone)]
pub struct Jobs {
    pool: PgPool,
}

impl Jobs {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        job_id: &str,
        filename: &str,
        study_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into etl_jobs (id, filename, study_id, status, progress, message)
            values ($1, $2, $3, 'queued', 0, 'Job queued for processing')
            on conflict (id) do update
              set filename = excluded.filename,
                  study_id = excluded.study_id,
                  status = excluded.status,
                  progress = excluded.progress,
                  message = excluded.message,
                  updated_at = now(),
                  completed_at = null
            "#,
        )
        .bind(job_id)
        .bind(filename)
        .bind(study_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Progress and message are only overwritten when supplied.
    pub async fn update(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: Option<u8>,
        message: Option<&str>,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            update etl_jobs
               set status = $2,
                   updated_at = now(),
                   completed_at = case when $2 = 'completed' then now() else completed_at end,
                   progress = coalesce($3, progress),
                   message = coalesce($4, message)
             where id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(progress.map(i32::from))
        .bind(message)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord> {
        sqlx::query_as::<_, JobRecord>(
            r#"
            select id, filename, study_id, status, progress, message,
                   created_at, updated_at, completed_at
            from etl_jobs where id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }
}

#[derive(Debug)]
struct JobUpdate {
    status: JobStatus,
    progress: Option<u8>,
    message: Option<String>,
}

/// [`StatusSink`] that records progress on one `etl_jobs` row.
///
/// Updates are queued on an unbounded channel and written by a background
/// task in arrival order, so reporting never waits on the database.
pub struct JobTracker {
    job_id: String,
    tx: mpsc::UnboundedSender<JobUpdate>,
}

impl JobTracker {
    pub fn spawn(jobs: Jobs, job_id: impl Into<String>) -> (Self, JoinHandle<()>) {
        let job_id = job_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<JobUpdate>();
        let writer_id = job_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(err) = jobs
                    .update(
                        &writer_id,
                        update.status,
                        update.progress,
                        update.message.as_deref(),
                    )
                    .await
                {
                    warn!(job_id = %writer_id, error = %err, "failed to persist job status");
                }
            }
        });
        (Self { job_id, tx }, handle)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn running(&self, progress: u8, message: impl Into<String>) {
        self.send(JobStatus::Running, Some(progress), Some(message.into()));
    }

    pub fn complete(&self, message: impl Into<String>) {
        info!(job_id = %self.job_id, "job completed");
        self.send(JobStatus::Completed, Some(100), Some(message.into()));
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(job_id = %self.job_id, %message, "job failed");
        self.send(JobStatus::Failed, None, Some(message));
    }

    fn send(&self, status: JobStatus, progress: Option<u8>, message: Option<String>) {
        // The writer only stops once every sender is gone.
        let _ = self.tx.send(JobUpdate {
            status,
            progress,
            message,
        });
    }
}

impl StatusSink for JobTracker {
    fn report(&self, update: StatusUpdate) {
        self.running(update.progress, update.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
