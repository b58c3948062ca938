mod common;

use std::sync::atomic::Ordering;

use anyhow::Result;
use clinflow::{Error, IngestMode, MeasurementType, NoopSink, metrics::metrics, testing::row};
use common::{at, start_store};

// Counters are process-wide, so this file holds a single test.
#[tokio::test]
async fn counters_only_move_for_committed_work() -> Result<()> {
    let (_container, store) = start_store().await?;

    // Stamping the merge watermark fails, which rolls back an atomic batch
    // after its rows were already loaded inside the transaction.
    sqlx::query(
        r#"
        create function reject_watermark() returns trigger language plpgsql as $$
        begin
            raise exception 'merge disabled';
        end
        $$
        "#,
    )
    .execute(store.pool())
    .await?;
    sqlx::query(
        "create trigger reject_watermark before update on clinical_measurements \
         for each row execute function reject_watermark()",
    )
    .execute(store.pool())
    .await?;

    let m = metrics();
    let err = store
        .ingest(
            vec![row("S1", "P1", MeasurementType::Glucose, "100", at(1, 10), 0.9)],
            IngestMode::Atomic,
            &NoopSink,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Db(_)), "{err:?}");
    assert_eq!(store.loader().count().await?, 0);
    assert_eq!(m.rows_loaded_total.load(Ordering::Relaxed), 0);
    assert_eq!(m.rows_merged_total.load(Ordering::Relaxed), 0);

    // Staged: the load commits and is counted, the merge is not.
    let err = store
        .ingest(
            vec![row("S1", "P1", MeasurementType::Glucose, "120", at(1, 14), 0.99)],
            IngestMode::Staged,
            &NoopSink,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartialFailure { stage: "aggregate", .. }), "{err:?}");
    assert_eq!(m.rows_loaded_total.load(Ordering::Relaxed), 1);
    assert_eq!(m.rows_merged_total.load(Ordering::Relaxed), 0);

    sqlx::query("drop trigger reject_watermark on clinical_measurements")
        .execute(store.pool())
        .await?;
    let pending = store.aggregations().pending_ids(10).await?;
    let merged = store.merge_aggregations(&pending).await?;
    assert_eq!(merged.merged_rows, 1);
    assert_eq!(m.rows_merged_total.load(Ordering::Relaxed), 1);
    assert_eq!(m.buckets_merged_total.load(Ordering::Relaxed), 1);
    Ok(())
}
