use chrono::{TimeZone, Utc};
use clinflow::aggregates::BucketKey;
use clinflow::testing::{RecordingSink, row};
use clinflow::{IngestMode, MeasurementType, SchemaConfig, Store};

#[tokio::main]
async fn main() -> clinflow::Result<()> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
    let store = Store::connect(&url).await?;

    // Ensure base schema
    store.schema().sync(&SchemaConfig::default()).await?;

    let at = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
    let batch = vec![
        row("S1", "P1", MeasurementType::Glucose, "100", at(10), 0.9),
        row("S1", "P1", MeasurementType::Glucose, "120", at(14), 0.99),
        row("S1", "P1", MeasurementType::BloodPressure, "120/80", at(10), 0.97),
    ];

    let sink = RecordingSink::default();
    let first = store
        .ingest(batch.clone(), IngestMode::Atomic, &sink)
        .await?;
    println!(
        "first run: {} inserted, {} rows merged",
        first.load.inserted_ids.len(),
        first.merge.merged_rows
    );

    // Replaying the same file changes nothing.
    let replay = store.ingest(batch, IngestMode::Atomic, &sink).await?;
    println!(
        "replay: {} inserted, {} skipped, {} rows merged",
        replay.load.inserted_ids.len(),
        replay.load.skipped,
        replay.merge.merged_rows
    );

    let key = BucketKey {
        day: at(0).date_naive(),
        study_id: "S1".into(),
        site_id: "SITE1".into(),
        participant_id: "P1".into(),
        measurement_type: MeasurementType::Glucose,
    };
    if let Some(stats) = store.aggregations().bucket(&key).await? {
        println!("glucose bucket: {}", serde_json::to_string_pretty(&stats)?);
    }
    for update in sink.updates() {
        println!("[{:>3}%] {}: {}", update.progress, update.stage, update.message);
    }
    Ok(())
}
