use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::measurement::{LOW_QUALITY_THRESHOLD, Measurement, MeasurementType};

/// Daily rollup key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub day: NaiveDate,
    pub study_id: String,
    pub site_id: String,
    pub participant_id: String,
    pub measurement_type: MeasurementType,
}

/// One measurement row as seen by the aggregation merger.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub key: BucketKey,
    pub value_num: Option<f64>,
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
    pub quality_score: f64,
}

impl From<&Measurement> for Observation {
    fn from(m: &Measurement) -> Self {
        Observation {
            key: BucketKey {
                day: m.day(),
                study_id: m.row.study_id.clone(),
                site_id: m.row.site_id.clone(),
                participant_id: m.row.participant_id.clone(),
                measurement_type: m.row.measurement_type,
            },
            value_num: m.reading.value_num(),
            systolic: m.reading.systolic(),
            diastolic: m.reading.diastolic(),
            quality_score: m.row.quality_score,
        }
    }
}

/// Running statistics for one bucket.
///
/// Averages are carried together with `count` so that two states can be
/// merged exactly without access to the rows behind them. `BucketStats::default()`
/// is the empty bucket and the identity element of [`BucketStats::merge`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub measurement_count: i64,
    pub avg_value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub avg_systolic: Option<f64>,
    pub avg_diastolic: Option<f64>,
    pub avg_quality_score: Option<f64>,
    pub low_quality_count: i64,
}

impl BucketStats {
    pub fn single(obs: &Observation) -> Self {
        BucketStats {
            measurement_count: 1,
            avg_value: obs.value_num,
            min_value: obs.value_num,
            max_value: obs.value_num,
            avg_systolic: obs.systolic,
            avg_diastolic: obs.diastolic,
            avg_quality_score: Some(obs.quality_score),
            low_quality_count: i64::from(obs.quality_score < LOW_QUALITY_THRESHOLD),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.measurement_count == 0
    }

    pub fn observe(&mut self, obs: &Observation) {
        *self = self.merge(&BucketStats::single(obs));
    }

    /// Count-weighted combination of two states. Commutative, and associative
    /// up to floating-point rounding.
    pub fn merge(&self, other: &BucketStats) -> BucketStats {
        let (a, b) = (self.measurement_count, other.measurement_count);
        let measurement_count = a + b;
        if measurement_count == 0 {
            return BucketStats::default();
        }
        BucketStats {
            measurement_count,
            avg_value: weighted(self.avg_value, a, other.avg_value, b),
            min_value: pick(self.min_value, other.min_value, f64::min),
            max_value: pick(self.max_value, other.max_value, f64::max),
            avg_systolic: weighted(self.avg_systolic, a, other.avg_systolic, b),
            avg_diastolic: weighted(self.avg_diastolic, a, other.avg_diastolic, b),
            avg_quality_score: weighted(self.avg_quality_score, a, other.avg_quality_score, b),
            low_quality_count: self.low_quality_count + other.low_quality_count,
        }
    }
}

fn weighted(x: Option<f64>, xn: i64, y: Option<f64>, yn: i64) -> Option<f64> {
    match (x, y) {
        (Some(x), Some(y)) => {
            let (xn, yn) = (xn as f64, yn as f64);
            Some((x * xn + y * yn) / (xn + yn))
        }
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

fn pick(x: Option<f64>, y: Option<f64>, f: fn(f64, f64) -> f64) -> Option<f64> {
    match (x, y) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Group observations into per-bucket partial statistics, ordered by key.
pub fn fold_partials<'a, I>(observations: I) -> BTreeMap<BucketKey, BucketStats>
where
    I: IntoIterator<Item = &'a Observation>,
{
    let mut out: BTreeMap<BucketKey, BucketStats> = BTreeMap::new();
    for obs in observations {
        out.entry(obs.key.clone()).or_default().observe(obs);
    }
    out
}

/// Merge a set of partial buckets into an existing rollup map.
pub fn merge_into(
    rollup: &mut BTreeMap<BucketKey, BucketStats>,
    partials: &BTreeMap<BucketKey, BucketStats>,
) {
    for (key, partial) in partials {
        let entry = rollup.entry(key.clone()).or_default();
        *entry = entry.merge(partial);
    }
}
