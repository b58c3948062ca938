use crate::{
    Result,
    dimensions::Dimensions,
    jobs::Jobs,
    loader::{BulkLoader, LoadOutcome},
    measurement::{Measurement, MeasurementRow},
    merge::{Aggregations, MergeOutcome},
    metrics,
    schema::{SchemaManager, quote_ident},
};
use chrono::Utc;
use sqlx::{
    Executor, PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self { pool })
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.pool.clone())
    }

    pub fn loader(&self) -> BulkLoader {
        BulkLoader::new(self.pool.clone())
    }

    pub fn aggregations(&self) -> Aggregations {
        Aggregations::new(self.pool.clone())
    }

    pub fn jobs(&self) -> Jobs {
        Jobs::new(self.pool.clone())
    }

    /// Register dimensions and persist the batch in one transaction.
    ///
    /// Rows whose identifier is already stored are skipped. The returned
    /// `loaded_ids` still lists them so the merge step can be re-driven with the
    /// same set.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn load(&self, rows: Vec<MeasurementRow>) -> Result<LoadOutcome> {
        let measurements = identify_all(rows)?;
        let mut tx = self.pool.begin().await?;
        self.dimensions()
            .register_all(&mut tx, &measurements)
            .await?;
        let outcome = self.loader().load(&mut tx, &measurements).await?;
        tx.commit().await?;
        metrics::record_load(&outcome);
        info!(
            inserted = outcome.inserted_ids.len(),
            skipped = outcome.skipped,
            "batch loaded"
        );
        Ok(outcome)
    }

    /// Fold the named rows into the daily rollups.
    ///
    /// Safe to call again with the same identifiers: rows already merged carry
    /// a watermark and are not counted twice.
    #[instrument(skip_all, fields(ids = ids.len()))]
    pub async fn merge_aggregations(&self, ids: &[Uuid]) -> Result<MergeOutcome> {
        if ids.is_empty() {
            return Ok(MergeOutcome::default());
        }
        let mut tx = self.pool.begin().await?;
        let outcome = self.aggregations().merge_tx(&mut tx, ids).await?;
        tx.commit().await?;
        metrics::record_merge(&outcome);
        Ok(outcome)
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }
}

pub(crate) fn identify_all(rows: Vec<MeasurementRow>) -> Result<Vec<Measurement>> {
    let processed_at = Utc::now();
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| row.identify_row(idx + 1, processed_at))
        .collect()
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    schema: Option<String>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            schema: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Resolve unqualified table names against `schema` on every pooled connection.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        if let Some(schema) = self.schema.filter(|s| s != "public") {
            let stmt = format!("set search_path to {}, public", quote_ident(&schema));
            opts = opts.after_connect(move |conn, _meta| {
                let stmt = stmt.clone();
                Box::pin(async move {
                    conn.execute(stmt.as_str()).await?;
                    Ok(())
                })
            });
        }
        let connect_opts = PgConnectOptions::from_str(&self.url)
            .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
        let pool = opts.connect_with(connect_opts).await?;
        Ok(Store { pool })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}
