//! Helpers shared by unit and integration tests.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    Result,
    measurement::{MeasurementRow, MeasurementType},
    schema::{SchemaConfig, SchemaManager},
    status::{StatusSink, StatusUpdate},
};

/// Create every core table and index in the `public` schema.
pub async fn migrate_core_schema(pool: &Pool<Postgres>) -> Result<()> {
    SchemaManager::new(pool.clone())
        .sync(&SchemaConfig::default())
        .await?;
    Ok(())
}

/// A valid row at site `SITE1` with unit `mg/dL`.
pub fn row(
    study_id: &str,
    participant_id: &str,
    measurement_type: MeasurementType,
    value: &str,
    timestamp: DateTime<Utc>,
    quality_score: f64,
) -> MeasurementRow {
    MeasurementRow {
        study_id: study_id.to_string(),
        participant_id: participant_id.to_string(),
        measurement_type,
        value: value.to_string(),
        unit: Some("mg/dL".to_string()),
        timestamp,
        site_id: "SITE1".to_string(),
        quality_score,
    }
}

/// Keeps every update it is sent, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.updates().iter().map(|u| u.progress).collect()
    }
}

impl StatusSink for RecordingSink {
    fn report(&self, update: StatusUpdate) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(update);
        }
    }
}
