//! Row schema at the pipeline boundary.
//!
//! Extracted records arrive as loosely typed text ([`RawRecord`]). They are
//! cleaned once here ([`transform`]) and checked against the fixed schema
//! ([`validate`]); nothing past this module looks at raw columns.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::Deserialize;

use crate::{
    Error, Result,
    measurement::{MeasurementRow, MeasurementType, Reading},
};

/// One source record as read from a file, before cleaning.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RawRecord {
    pub study_id: Option<String>,
    pub participant_id: Option<String>,
    pub measurement_type: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
    pub timestamp: Option<String>,
    pub site_id: Option<String>,
    pub quality_score: Option<String>,
}

/// A record after trimming and type coercion. Fields may still be missing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CleanRecord {
    pub study_id: Option<String>,
    pub participant_id: Option<String>,
    pub measurement_type: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub site_id: Option<String>,
    pub quality_score: Option<f64>,
}

/// `"Quality Score "` → `"quality_score"`.
pub fn normalize_header(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

fn clean_text(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Parse an ISO-8601 instant and convert it to UTC at microsecond precision.
/// Values without an offset are taken to be UTC already.
pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc).trunc_subsecs(6));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc().trunc_subsecs(6));
        }
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(ts.with_timezone(&Utc).trunc_subsecs(6));
    }
    Err(format!("`{raw}` is not an ISO-8601 timestamp"))
}

/// Trim strings, lower-case the measurement type, parse the timestamp and
/// clamp the quality score into `[0, 1]`.
pub fn transform(records: Vec<RawRecord>) -> Result<Vec<CleanRecord>> {
    records
        .into_iter()
        .enumerate()
        .map(|(idx, raw)| clean_record(idx + 1, raw))
        .collect()
}

fn clean_record(row: usize, raw: RawRecord) -> Result<CleanRecord> {
    let timestamp = clean_text(raw.timestamp)
        .map(|t| parse_timestamp(&t))
        .transpose()
        .map_err(|detail| Error::InvalidValue {
            row,
            field: "timestamp",
            detail,
        })?;
    let quality_score = clean_text(raw.quality_score)
        .map(|q| match q.parse::<f64>() {
            Ok(v) if !v.is_nan() => Ok(v.clamp(0.0, 1.0)),
            _ => Err(format!("`{q}` is not a number")),
        })
        .transpose()
        .map_err(|detail| Error::InvalidValue {
            row,
            field: "quality_score",
            detail,
        })?;

    Ok(CleanRecord {
        study_id: clean_text(raw.study_id),
        participant_id: clean_text(raw.participant_id),
        measurement_type: clean_text(raw.measurement_type).map(|t| t.to_lowercase()),
        value: clean_text(raw.value),
        unit: clean_text(raw.unit),
        timestamp,
        site_id: clean_text(raw.site_id),
        quality_score,
    })
}

/// Check one record against the fixed row schema.
pub fn validate_record(row: usize, rec: CleanRecord) -> Result<MeasurementRow> {
    fn required<T>(row: usize, field: &'static str, v: Option<T>) -> Result<T> {
        v.ok_or(Error::MissingRequiredField { row, field })
    }

    let study_id = required(row, "study_id", rec.study_id)?;
    let participant_id = required(row, "participant_id", rec.participant_id)?;
    let measurement_type: MeasurementType =
        required(row, "measurement_type", rec.measurement_type)?.parse()?;
    let value = required(row, "value", rec.value)?;
    let timestamp = required(row, "timestamp", rec.timestamp)?;
    let site_id = required(row, "site_id", rec.site_id)?;
    let quality_score = required(row, "quality_score", rec.quality_score)?;

    Reading::parse(measurement_type, &value).map_err(|detail| Error::InvalidValue {
        row,
        field: "value",
        detail,
    })?;

    Ok(MeasurementRow {
        study_id,
        participant_id,
        measurement_type,
        value,
        unit: rec.unit,
        timestamp,
        site_id,
        quality_score,
    })
}

/// Validate every record, reporting all problems at once.
pub fn validate(records: Vec<CleanRecord>) -> Result<Vec<MeasurementRow>> {
    let mut rows = Vec::with_capacity(records.len());
    let mut errors = Vec::new();
    for (idx, rec) in records.into_iter().enumerate() {
        match validate_record(idx + 1, rec) {
            Ok(row) => rows.push(row),
            Err(err) => errors.push(err.to_string()),
        }
    }
    if errors.is_empty() {
        Ok(rows)
    } else {
        Err(Error::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn raw(kind: &str, value: &str, ts: &str, quality: &str) -> RawRecord {
        RawRecord {
            study_id: Some(" S1 ".into()),
            participant_id: Some("P1".into()),
            measurement_type: Some(kind.into()),
            value: Some(value.into()),
            unit: Some("mg/dL".into()),
            timestamp: Some(ts.into()),
            site_id: Some("SITE1".into()),
            quality_score: Some(quality.into()),
        }
    }

    #[test]
    fn headers_are_snake_cased() {
        assert_eq!(normalize_header(" Quality Score "), "quality_score");
        assert_eq!(normalize_header("Study_ID"), "study_id");
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        let ts = parse_timestamp("2024-01-01T12:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        let naive = parse_timestamp("2024-01-01 10:00:00").unwrap();
        assert_eq!(naive, ts);
    }

    #[test]
    fn timestamps_truncate_to_microseconds() {
        let ts = parse_timestamp("2024-01-01T10:00:00.123456789Z").unwrap();
        assert_eq!(ts.nanosecond(), 123_456_000);
    }

    #[test]
    fn transform_trims_and_clamps() {
        let out = transform(vec![raw(" Glucose ", " 100 ", "2024-01-01T10:00:00Z", "1.7")]).unwrap();
        let rec = &out[0];
        assert_eq!(rec.study_id.as_deref(), Some("S1"));
        assert_eq!(rec.measurement_type.as_deref(), Some("glucose"));
        assert_eq!(rec.value.as_deref(), Some("100"));
        assert_eq!(rec.quality_score, Some(1.0));
    }

    #[test]
    fn transform_rejects_unparseable_timestamp() {
        let err = transform(vec![raw("glucose", "100", "yesterday", "0.9")]).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { row: 1, field: "timestamp", .. }));
    }

    #[test]
    fn validate_reports_missing_field() {
        let mut rec = transform(vec![raw("glucose", "100", "2024-01-01T10:00:00Z", "0.9")])
            .unwrap()
            .remove(0);
        rec.site_id = None;
        let err = validate_record(3, rec).unwrap_err();
        assert!(matches!(err, Error::MissingRequiredField { row: 3, field: "site_id" }));
    }

    #[test]
    fn validate_collects_every_problem() {
        let recs = transform(vec![
            raw("glucose", "100", "2024-01-01T10:00:00Z", "0.9"),
            raw("temperature", "37", "2024-01-01T10:00:00Z", "0.9"),
            raw("blood_pressure", "120", "2024-01-01T10:00:00Z", "0.9"),
        ])
        .unwrap();
        match validate(recs).unwrap_err() {
            Error::Validation(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("temperature"));
                assert!(errors[1].contains("systolic/diastolic"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
