mod common;

use anyhow::Result;
use chrono::Duration;
use clinflow::{
    Error, IngestMode, MeasurementRow, MeasurementType, NoopSink,
    aggregates::BucketKey,
    testing::{RecordingSink, row},
};
use common::{at, start_store};

fn glucose_key(day: u32) -> BucketKey {
    BucketKey {
        day: at(day, 0).date_naive(),
        study_id: "S1".into(),
        site_id: "SITE1".into(),
        participant_id: "P1".into(),
        measurement_type: MeasurementType::Glucose,
    }
}

fn study_key(study_id: &str) -> BucketKey {
    BucketKey {
        study_id: study_id.into(),
        ..glucose_key(1)
    }
}

#[tokio::test]
async fn split_batches_produce_exact_daily_rollup_in_either_order() -> Result<()> {
    let (_container, store) = start_store().await?;

    for (study, hours) in [("S-FWD", [10, 14]), ("S-REV", [14, 10])] {
        for hour in hours {
            let (value, quality) = if hour == 10 { ("100", 0.9) } else { ("120", 0.99) };
            store
                .ingest(
                    vec![row(study, "P1", MeasurementType::Glucose, value, at(1, hour), quality)],
                    IngestMode::Atomic,
                    &NoopSink,
                )
                .await?;
        }

        let stats = store
            .aggregations()
            .bucket(&study_key(study))
            .await?
            .expect("bucket exists");
        assert_eq!(stats.measurement_count, 2, "{study}");
        assert_eq!(stats.avg_value, Some(110.0), "{study}");
        assert_eq!(stats.min_value, Some(100.0), "{study}");
        assert_eq!(stats.max_value, Some(120.0), "{study}");
        assert!((stats.avg_quality_score.unwrap() - 0.945).abs() < 1e-9);
        assert_eq!(stats.low_quality_count, 1, "{study}");
        assert_eq!(
            store.dimensions().enrolled_at("P1", study).await?,
            Some(at(1, 10)),
            "{study}"
        );
    }
    Ok(())
}

fn spaced_batch(study: &str, first_hour: u32, base_value: u32, n: u32) -> Vec<MeasurementRow> {
    (0..n)
        .map(|i| {
            row(
                study,
                "P1",
                MeasurementType::Glucose,
                &(base_value + i).to_string(),
                at(1, first_hour) + Duration::seconds(i64::from(i)),
                0.99,
            )
        })
        .collect()
}

#[tokio::test]
async fn concurrent_disjoint_ingests_merge_into_one_bucket() -> Result<()> {
    let (_container, store) = start_store().await?;

    for (study, mode) in [("S-ATOMIC", IngestMode::Atomic), ("S-STAGED", IngestMode::Staged)] {
        // Atomic writers queue behind each other on the shared enrollment row;
        // staged merges run in their own transactions and meet at the bucket lock.
        let left = spaced_batch(study, 8, 100, 50);
        let right = spaced_batch(study, 16, 150, 50);

        let (a, b) = tokio::join!(
            store.ingest(left, mode, &NoopSink),
            store.ingest(right, mode, &NoopSink),
        );
        let (a, b) = (a?, b?);
        assert_eq!(a.merge.merged_rows + b.merge.merged_rows, 100, "{study}");

        let stats = store.aggregations().bucket(&study_key(study)).await?.unwrap();
        assert_eq!(stats.measurement_count, 100, "{study}");
        assert_eq!(stats.min_value, Some(100.0), "{study}");
        assert_eq!(stats.max_value, Some(199.0), "{study}");
        assert!((stats.avg_value.unwrap() - 149.5).abs() < 1e-9, "{study}");
        assert_eq!(stats.low_quality_count, 0, "{study}");
        assert_eq!(
            store.dimensions().enrolled_at("P1", study).await?,
            Some(at(1, 8)),
            "{study}"
        );
    }
    assert!(store.aggregations().pending_ids(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn replaying_a_batch_changes_nothing() -> Result<()> {
    let (_container, store) = start_store().await?;
    let batch = vec![
        row("S1", "P1", MeasurementType::Glucose, "100", at(1, 10), 0.9),
        row("S1", "P1", MeasurementType::Glucose, "120", at(1, 14), 0.99),
        row("S1", "P2", MeasurementType::HeartRate, "72", at(2, 8), 0.97),
    ];

    let first = store
        .ingest(batch.clone(), IngestMode::Atomic, &NoopSink)
        .await?;
    assert_eq!(first.load.inserted_ids.len(), 3);
    assert_eq!(first.merge.merged_rows, 3);
    let before = store.aggregations().buckets_for_study("S1").await?;

    let replay = store.ingest(batch, IngestMode::Atomic, &NoopSink).await?;
    assert!(replay.load.inserted_ids.is_empty());
    assert_eq!(replay.load.skipped, 3);
    assert_eq!(replay.merge.merged_rows, 0);
    assert_eq!(replay.merge.ignored(), 3);

    assert_eq!(store.loader().count().await?, 3);
    assert_eq!(store.aggregations().buckets_for_study("S1").await?, before);
    Ok(())
}

#[tokio::test]
async fn duplicate_rows_within_a_batch_count_once() -> Result<()> {
    let (_container, store) = start_store().await?;
    let r = row("S1", "P1", MeasurementType::Glucose, "100", at(1, 10), 0.9);

    let outcome = store
        .ingest(vec![r.clone(), r], IngestMode::Atomic, &NoopSink)
        .await?;
    assert_eq!(outcome.load.loaded_ids.len(), 1);
    assert_eq!(outcome.merge.merged_rows, 1);

    let stats = store.aggregations().bucket(&glucose_key(1)).await?.unwrap();
    assert_eq!(stats.measurement_count, 1);
    Ok(())
}

#[tokio::test]
async fn blood_pressure_rollup_keeps_scalar_columns_null() -> Result<()> {
    let (_container, store) = start_store().await?;
    store
        .ingest(
            vec![
                row("S1", "P1", MeasurementType::BloodPressure, "120/80", at(1, 9), 0.99),
                row("S1", "P1", MeasurementType::BloodPressure, "130/90", at(1, 18), 0.99),
            ],
            IngestMode::Atomic,
            &NoopSink,
        )
        .await?;

    let key = BucketKey {
        measurement_type: MeasurementType::BloodPressure,
        ..glucose_key(1)
    };
    let stats = store.aggregations().bucket(&key).await?.unwrap();
    assert_eq!(stats.measurement_count, 2);
    assert_eq!(stats.avg_systolic, Some(125.0));
    assert_eq!(stats.avg_diastolic, Some(85.0));
    assert_eq!(stats.avg_value, None);
    assert_eq!(stats.min_value, None);
    Ok(())
}

#[tokio::test]
async fn enrollment_keeps_earliest_timestamp() -> Result<()> {
    let (_container, store) = start_store().await?;

    store
        .ingest(
            vec![
                row("S1", "P1", MeasurementType::Weight, "70", at(3, 12), 0.99),
                row("S1", "P1", MeasurementType::Weight, "71", at(2, 12), 0.99),
            ],
            IngestMode::Atomic,
            &NoopSink,
        )
        .await?;
    let dims = store.dimensions();
    assert_eq!(dims.enrolled_at("P1", "S1").await?, Some(at(2, 12)));

    // Later readings never move enrollment forward.
    store
        .ingest(
            vec![row("S1", "P1", MeasurementType::Weight, "72", at(5, 12), 0.99)],
            IngestMode::Atomic,
            &NoopSink,
        )
        .await?;
    assert_eq!(dims.enrolled_at("P1", "S1").await?, Some(at(2, 12)));

    store
        .ingest(
            vec![row("S1", "P1", MeasurementType::Weight, "69", at(1, 12), 0.99)],
            IngestMode::Atomic,
            &NoopSink,
        )
        .await?;
    assert_eq!(dims.enrolled_at("P1", "S1").await?, Some(at(1, 12)));
    assert!(dims.study_exists("S1").await?);
    Ok(())
}

#[tokio::test]
async fn constraint_violation_aborts_whole_batch() -> Result<()> {
    let (_container, store) = start_store().await?;
    let batch = vec![
        row("S9", "P1", MeasurementType::Glucose, "100", at(1, 10), 0.9),
        row("S9", "P1", MeasurementType::Glucose, "101", at(1, 11), 1.5),
    ];

    let err = store
        .ingest(batch, IngestMode::Atomic, &NoopSink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { .. }), "{err:?}");

    assert_eq!(store.loader().count().await?, 0);
    assert!(!store.dimensions().study_exists("S9").await?);
    assert!(store.aggregations().buckets_for_study("S9").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn pending_rows_are_recovered_by_rerunning_merge() -> Result<()> {
    let (_container, store) = start_store().await?;

    // Load without merging, as if the process died between the two steps.
    let load = store
        .load(vec![
            row("S1", "P1", MeasurementType::Glucose, "100", at(1, 10), 0.9),
            row("S1", "P1", MeasurementType::Glucose, "120", at(1, 14), 0.99),
        ])
        .await?;
    assert!(store.aggregations().bucket(&glucose_key(1)).await?.is_none());

    let mut pending = store.aggregations().pending_ids(100).await?;
    pending.sort();
    let mut loaded = load.loaded_ids.clone();
    loaded.sort();
    assert_eq!(pending, loaded);

    let merged = store.merge_aggregations(&pending).await?;
    assert_eq!(merged.merged_rows, 2);
    assert_eq!(merged.buckets, 1);

    // A second recovery attempt is a no-op.
    let again = store.merge_aggregations(&load.loaded_ids).await?;
    assert_eq!(again.merged_rows, 0);
    assert!(store.aggregations().pending_ids(100).await?.is_empty());

    let stats = store.aggregations().bucket(&glucose_key(1)).await?.unwrap();
    assert_eq!(stats.measurement_count, 2);
    assert_eq!(stats.avg_value, Some(110.0));
    Ok(())
}

#[tokio::test]
async fn staged_mode_reports_progress() -> Result<()> {
    let (_container, store) = start_store().await?;
    let sink = RecordingSink::default();

    let outcome = store
        .ingest(
            vec![row("S1", "P1", MeasurementType::Height, "180", at(1, 10), 0.99)],
            IngestMode::Staged,
            &sink,
        )
        .await?;
    assert_eq!(outcome.merge.merged_rows, 1);
    assert_eq!(sink.progress(), vec![60, 80, 95]);
    assert!(store.aggregations().pending_ids(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_overlapping_ingests_count_each_row_once() -> Result<()> {
    let (_container, store) = start_store().await?;
    let batch: Vec<_> = (0..20)
        .map(|i| {
            row(
                "S1",
                "P1",
                MeasurementType::Glucose,
                &format!("{}", 90 + i),
                at(1, i),
                0.96,
            )
        })
        .collect();

    let (a, b) = tokio::join!(
        store.ingest(batch.clone(), IngestMode::Atomic, &NoopSink),
        store.ingest(batch.clone(), IngestMode::Atomic, &NoopSink),
    );
    let (a, b) = (a?, b?);
    assert_eq!(a.merge.merged_rows + b.merge.merged_rows, 20);

    let stats = store.aggregations().bucket(&glucose_key(1)).await?.unwrap();
    assert_eq!(stats.measurement_count, 20);
    assert_eq!(stats.min_value, Some(90.0));
    assert_eq!(stats.max_value, Some(109.0));
    Ok(())
}

#[tokio::test]
async fn rows_sharing_an_identifier_abort_the_batch() -> Result<()> {
    let (_container, store) = start_store().await?;
    let batch = vec![
        row("S|1", "P", MeasurementType::Glucose, "100", at(1, 10), 0.9),
        row("S", "1|P", MeasurementType::Glucose, "100", at(1, 10), 0.9),
    ];

    let err = store
        .ingest(batch, IngestMode::Atomic, &NoopSink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { .. }), "{err:?}");
    assert_eq!(store.loader().count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn unparseable_value_names_its_batch_row() -> Result<()> {
    let (_container, store) = start_store().await?;
    let batch = vec![
        row("S1", "P1", MeasurementType::Glucose, "100", at(1, 10), 0.9),
        row("S1", "P1", MeasurementType::BloodPressure, "120", at(1, 11), 0.9),
    ];

    let err = store.load(batch).await.unwrap_err();
    assert!(
        matches!(err, Error::InvalidValue { row: 2, field: "value", .. }),
        "{err:?}"
    );
    Ok(())
}
