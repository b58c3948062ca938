use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clinflow::{IngestMode, Pipeline, PipelineConfig, SchemaConfig, Store};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "clinflow", version, about = "Clinical measurement ingest CLI")]
struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema holding the clinflow tables (default: public)
    #[arg(long, default_value = "public")]
    schema: String,

    #[arg(long, default_value_t = 10)]
    max_connections: u32,

    /// Directory input files are read from
    #[arg(long, env = "CLINFLOW_DATA_DIR", default_value = "/data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan,

    /// Apply DDL changes (create schema/tables/indexes as needed)
    SchemaSync,

    /// Create a job for a file and run it through the pipeline
    Run {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        study_id: Option<String>,
        #[arg(long, value_enum, default_value_t = Mode::Atomic)]
        mode: Mode,
    },

    /// Re-run the aggregation merge for loaded rows
    Merge {
        /// Measurement ids (repeatable)
        #[arg(long = "id")]
        ids: Vec<Uuid>,
        /// Merge up to this many pending rows instead of explicit ids
        #[arg(long, conflicts_with = "ids")]
        pending: Option<i64>,
    },

    /// Print a job's status as JSON
    JobStatus { job_id: String },

    /// Print process counters in Prometheus text format
    Metrics,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Atomic,
    Staged,
}

impl From<Mode> for IngestMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Atomic => IngestMode::Atomic,
            Mode::Staged => IngestMode::Staged,
        }
    }
}

#[tokio::main]
async fn main() -> clinflow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SchemaConfig::with_base_schema(cli.schema.clone());
    let connect = || open_store(cli.database_url.clone(), &cli.schema, cli.max_connections);

    match &cli.command {
        Commands::SchemaPlan => {
            let store = connect().await?;
            let plan = store.schema().plan(&config).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let store = connect().await?;
            let plan = store.schema().sync(&config).await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::Run {
            job_id,
            file,
            study_id,
            mode,
        } => {
            let store = connect().await?;
            store
                .jobs()
                .create(job_id, file, study_id.as_deref())
                .await?;
            let pipeline = Pipeline::new(
                store,
                PipelineConfig {
                    data_dir: cli.data_dir.clone(),
                    ingest_mode: (*mode).into(),
                },
            );
            let outcome = pipeline.run(job_id, file).await?;
            println!(
                "Loaded {} rows ({} new, {} skipped); merged {} rows into {} buckets.",
                outcome.load.loaded_ids.len(),
                outcome.load.inserted_ids.len(),
                outcome.load.skipped,
                outcome.merge.merged_rows,
                outcome.merge.buckets
            );
        }
        Commands::Merge { ids, pending } => {
            let store = connect().await?;
            let ids = match pending {
                Some(limit) => store.aggregations().pending_ids(*limit).await?,
                None => ids.clone(),
            };
            let outcome = store.merge_aggregations(&ids).await?;
            println!(
                "Merged {} of {} rows into {} buckets ({} already aggregated).",
                outcome.merged_rows,
                outcome.requested,
                outcome.buckets,
                outcome.ignored()
            );
        }
        Commands::JobStatus { job_id } => {
            let store = connect().await?;
            let job = store.jobs().get(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Metrics => print!("{}", clinflow::metrics::render_prometheus()),
    }

    Ok(())
}

async fn open_store(
    url: Option<String>,
    schema: &str,
    max_connections: u32,
) -> clinflow::Result<Store> {
    let Some(url) = url else {
        eprintln!("error: --database-url or env DATABASE_URL is required");
        std::process::exit(2);
    };
    Store::builder(url)
        .max_connections(max_connections)
        .schema(schema)
        .build()
        .await
}

fn print_plan(plan: &clinflow::SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
