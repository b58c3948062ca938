use std::collections::HashSet;

use crate::{Result, measurement::MeasurementType};
use indoc::formatdoc;
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.base_schema.trim();
        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let schema_exists = self.existing_schemas().await?.contains(schema);
        self.plan_core_schema(&mut plan, schema, schema_exists)
            .await?;
        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn plan_core_schema(
        &self,
        plan: &mut SchemaPlan,
        schema: &str,
        schema_exists: bool,
    ) -> Result<()> {
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };

        // Dimensions
        for (table, key) in [
            ("studies", "study_id"),
            ("participants", "participant_id"),
            ("sites", "site_id"),
        ] {
            ensure_table(plan, schema, &existing_tables, table, |s| {
                build_dimension_table_sql(s, table, key)
            });
        }
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "participant_enrollments",
            build_enrollments_table_sql,
        );

        // Facts and rollups
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "clinical_measurements",
            build_measurements_table_sql,
        );
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "measurement_aggregations",
            build_aggregations_table_sql,
        );

        // Job bookkeeping
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "etl_jobs",
            build_jobs_table_sql,
        );

        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };

        // Keeps the watermark scan proportional to the unmerged backlog.
        ensure_index(
            plan,
            schema,
            &existing_indexes,
            "clinical_measurements_unaggregated_idx",
            build_unaggregated_index_sql,
        );
        ensure_index(
            plan,
            schema,
            &existing_indexes,
            "measurement_aggregations_study_idx",
            build_aggregations_study_index_sql,
        );

        Ok(())
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub base_schema: String,
}

impl SchemaConfig {
    pub fn with_base_schema(schema: impl Into<String>) -> Self {
        Self {
            base_schema: schema.into(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            base_schema: "public".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_indexes: &HashSet<String>,
    index: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_indexes.contains(index) {
        plan.push_action(
            format!("create index {}", qualified_name(schema, index)),
            build_sql(schema),
        );
    }
}

fn build_dimension_table_sql(schema: &str, table: &str, key: &str) -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            {key} text primary key,
            created_at timestamptz not null default now()
        )
        "#,
        table = qualified_name(schema, table),
        key = quote_ident(key),
    )
}

fn build_enrollments_table_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            participant_id text not null references {participants} (participant_id),
            study_id text not null references {studies} (study_id),
            enrolled_at timestamptz not null,
            primary key (participant_id, study_id)
        )
        "#,
        table = qualified_name(schema, "participant_enrollments"),
        participants = qualified_name(schema, "participants"),
        studies = qualified_name(schema, "studies"),
    )
}

fn measurement_type_check() -> String {
    MeasurementType::ALL
        .iter()
        .map(|t| format!("'{}'", t.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_measurements_table_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            id uuid primary key,
            study_id text not null references {studies} (study_id),
            participant_id text not null references {participants} (participant_id),
            measurement_type text not null check (measurement_type in ({types})),
            value text not null,
            value_num double precision null,
            bp_systolic double precision null,
            bp_diastolic double precision null,
            unit text null,
            "timestamp" timestamptz not null,
            site_id text not null references {sites} (site_id),
            quality_score double precision not null check (quality_score between 0 and 1),
            processed_at timestamptz not null,
            created_at timestamptz not null default now(),
            aggregated_at timestamptz null
        )
        "#,
        table = qualified_name(schema, "clinical_measurements"),
        studies = qualified_name(schema, "studies"),
        participants = qualified_name(schema, "participants"),
        sites = qualified_name(schema, "sites"),
        types = measurement_type_check(),
    )
}

fn build_aggregations_table_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            agg_day date not null,
            study_id text not null,
            site_id text not null,
            participant_id text not null,
            measurement_type text not null,
            measurement_count bigint not null default 0,
            avg_value double precision null,
            min_value double precision null,
            max_value double precision null,
            avg_systolic double precision null,
            avg_diastolic double precision null,
            avg_quality_score double precision null,
            low_quality_count bigint not null default 0,
            updated_at timestamptz not null default now(),
            primary key (agg_day, study_id, site_id, participant_id, measurement_type)
        )
        "#,
        table = qualified_name(schema, "measurement_aggregations"),
    )
}

fn build_jobs_table_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            id text primary key,
            filename text not null,
            study_id text null,
            status text not null,
            progress int not null default 0,
            message text null,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            completed_at timestamptz null
        )
        "#,
        table = qualified_name(schema, "etl_jobs"),
    )
}

fn build_unaggregated_index_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create index if not exists {index}
            on {table} (id)
            where aggregated_at is null
        "#,
        index = quote_ident("clinical_measurements_unaggregated_idx"),
        table = qualified_name(schema, "clinical_measurements"),
    )
}

fn build_aggregations_study_index_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create index if not exists {index}
            on {table} (study_id, agg_day)
        "#,
        index = quote_ident("measurement_aggregations_study_idx"),
        table = qualified_name(schema, "measurement_aggregations"),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
