//! Content-derived row identifiers.
//!
//! A measurement's identifier is the MD5 digest of its five business-key
//! fields joined with `|`, laid out directly as a UUID. Replaying a file
//! therefore produces the same identifiers on any host, which is what lets the
//! bulk loader treat an existing id as "this exact row is already stored".

use chrono::{DateTime, Timelike, Utc};
use md5::{Digest, Md5};
use uuid::Uuid;

use crate::measurement::MeasurementType;

const DELIMITER: char = '|';

/// Borrowed view over the fields that make up a row's identity.
#[derive(Clone, Copy, Debug)]
pub struct IdentityKey<'a> {
    pub study_id: &'a str,
    pub participant_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub measurement_type: MeasurementType,
    pub value: &'a str,
}

pub fn assign_identity(key: &IdentityKey<'_>) -> Uuid {
    let digest = Md5::digest(identity_text(key).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    Uuid::from_bytes(bytes)
}

fn identity_text(key: &IdentityKey<'_>) -> String {
    let mut text = String::with_capacity(
        key.study_id.len() + key.participant_id.len() + key.value.len() + 48,
    );
    text.push_str(key.study_id);
    text.push(DELIMITER);
    text.push_str(key.participant_id);
    text.push(DELIMITER);
    text.push_str(&canonical_timestamp(key.timestamp));
    text.push(DELIMITER);
    text.push_str(key.measurement_type.as_str());
    text.push(DELIMITER);
    text.push_str(key.value);
    text
}

/// `YYYY-MM-DD HH:MM:SS[.ffffff]+00:00`; the fraction only appears when the
/// microsecond component is nonzero.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    let micros = ts.nanosecond() / 1_000;
    if micros == 0 {
        ts.format("%Y-%m-%d %H:%M:%S+00:00").to_string()
    } else {
        format!("{}.{micros:06}+00:00", ts.format("%Y-%m-%d %H:%M:%S"))
    }
}
