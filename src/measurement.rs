use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result, identity};

/// Rows scoring below this are counted as low quality in rollups.
pub const LOW_QUALITY_THRESHOLD: f64 = 0.95;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    Glucose,
    Cholesterol,
    Weight,
    Height,
    BloodPressure,
    HeartRate,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 6] = [
        MeasurementType::Glucose,
        MeasurementType::Cholesterol,
        MeasurementType::Weight,
        MeasurementType::Height,
        MeasurementType::BloodPressure,
        MeasurementType::HeartRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementType::Glucose => "glucose",
            MeasurementType::Cholesterol => "cholesterol",
            MeasurementType::Weight => "weight",
            MeasurementType::Height => "height",
            MeasurementType::BloodPressure => "blood_pressure",
            MeasurementType::HeartRate => "heart_rate",
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MeasurementType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidEnum {
                value: s.to_string(),
            })
    }
}

/// Numeric interpretation of a canonical value string.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reading {
    Scalar(f64),
    BloodPressure { systolic: f64, diastolic: f64 },
}

impl Reading {
    /// Blood pressure is written `systolic/diastolic`; every other type is a plain number.
    pub fn parse(kind: MeasurementType, value: &str) -> std::result::Result<Self, String> {
        match kind {
            MeasurementType::BloodPressure => {
                let (sys, dia) = value
                    .split_once('/')
                    .ok_or_else(|| format!("expected `systolic/diastolic`, got `{value}`"))?;
                Ok(Reading::BloodPressure {
                    systolic: parse_finite(sys.trim())?,
                    diastolic: parse_finite(dia.trim())?,
                })
            }
            _ => Ok(Reading::Scalar(parse_finite(value)?)),
        }
    }

    pub fn value_num(&self) -> Option<f64> {
        match self {
            Reading::Scalar(v) => Some(*v),
            Reading::BloodPressure { .. } => None,
        }
    }

    pub fn systolic(&self) -> Option<f64> {
        match self {
            Reading::BloodPressure { systolic, .. } => Some(*systolic),
            Reading::Scalar(_) => None,
        }
    }

    pub fn diastolic(&self) -> Option<f64> {
        match self {
            Reading::BloodPressure { diastolic, .. } => Some(*diastolic),
            Reading::Scalar(_) => None,
        }
    }
}

fn parse_finite(s: &str) -> std::result::Result<f64, String> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("`{s}` is not a finite number")),
    }
}

/// A cleaned, validated row as handed to the core.
///
/// All string fields are trimmed and `timestamp` is a UTC instant at
/// microsecond precision. Identity is computed from these exact values, so
/// nothing downstream may re-normalize them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub study_id: String,
    pub participant_id: String,
    pub measurement_type: MeasurementType,
    pub value: String,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub site_id: String,
    pub quality_score: f64,
}

impl MeasurementRow {
    pub fn reading(&self) -> std::result::Result<Reading, String> {
        Reading::parse(self.measurement_type, &self.value)
    }

    /// Attach the content-derived identifier and derived numeric columns.
    pub fn identify(self, processed_at: DateTime<Utc>) -> Result<Measurement> {
        self.identify_row(1, processed_at)
    }

    /// As [`MeasurementRow::identify`], reporting a bad value against the
    /// 1-based batch position `row`.
    pub fn identify_row(self, row: usize, processed_at: DateTime<Utc>) -> Result<Measurement> {
        let reading = self.reading().map_err(|detail| Error::InvalidValue {
            row,
            field: "value",
            detail,
        })?;
        let id = identity::assign_identity(&identity::IdentityKey {
            study_id: &self.study_id,
            participant_id: &self.participant_id,
            timestamp: self.timestamp,
            measurement_type: self.measurement_type,
            value: &self.value,
        });
        Ok(Measurement {
            id,
            row: self,
            reading,
            processed_at,
        })
    }
}

/// A fact row ready for the bulk loader.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub id: Uuid,
    pub row: MeasurementRow,
    pub reading: Reading,
    pub processed_at: DateTime<Utc>,
}

impl Measurement {
    pub fn day(&self) -> NaiveDate {
        self.row.timestamp.date_naive()
    }
}
