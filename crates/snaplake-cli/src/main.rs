use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use snaplake_adapters::{all_families, family_for_id, DocumentFamily, FAMILY_IDS};
use snaplake_index::{
    city_kpis_mapping, movies_enriched_mapping, movies_kpis_mapping, IndexMapping, SearchClient, SearchConfig,
    CITY_KPIS_INDEX, MOVIES_INDEX, MOVIE_KPIS_INDEX,
};
use snaplake_storage::SnapshotResolver;
use snaplake_sync::{
    aggregate, format_geography_partition, format_weather_partition, kpi_search_row, load_snapshot,
    movie_kpi_summary_row, movie_search_rows, read_kpi_partition, PgRawStore, PipelineConfig, RawStore, ScoreModel,
    FORMATTED_PREFIX, KPI_ID_COLUMNS, MOVIE_ID_COLUMNS, MOVIE_KPI_ID_COLUMNS,
};
use snaplake_core::SearchRow;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "snaplake")]
#[command(about = "Snapshot datalake pipeline: raw load, formatting, KPI aggregation, search publishing")]
struct Cli {
    /// Datalake root; overrides SNAPLAKE_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Logical date (YYYY-MM-DD); latest partition when omitted.
    #[arg(long, global = true)]
    snapshot_date: Option<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert raw document partitions into Postgres.
    Load {
        /// Restrict to one family (tmdb_popular, tmdb_details, omdb_ratings).
        #[arg(long)]
        family: Option<String>,
    },
    /// Flatten raw weather and geocoding partitions into Parquet.
    Format,
    /// Build the city KPI partition from formatted partitions.
    Aggregate,
    /// Bulk publish a dataset into its search index.
    Publish {
        #[arg(value_enum)]
        target: Target,
    },
    /// Drop and recreate a search index with its mapping.
    RebuildIndex {
        #[arg(value_enum)]
        target: Target,
    },
    /// Print the partition a base directory resolves to.
    Resolve {
        base: PathBuf,
        #[arg(long, default_value = FORMATTED_PREFIX)]
        prefix: String,
        /// Descend into the latest `run=*` directory of the resolved date.
        #[arg(long)]
        latest_run: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    Kpis,
    Movies,
    MovieKpis,
}

impl Target {
    fn index(self) -> (&'static str, IndexMapping) {
        match self {
            Target::Kpis => (CITY_KPIS_INDEX, city_kpis_mapping()),
            Target::Movies => (MOVIES_INDEX, movies_enriched_mapping()),
            Target::MovieKpis => (MOVIE_KPIS_INDEX, movies_kpis_mapping()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if cli.snapshot_date.is_some() {
        config.snapshot_date = cli.snapshot_date;
    }

    match cli.command {
        Commands::Load { family } => run_load(&config, family.as_deref()).await?,
        Commands::Format => run_format(&config)?,
        Commands::Aggregate => run_aggregate(&config)?,
        Commands::Publish { target } => run_publish(&config, target).await?,
        Commands::RebuildIndex { target } => {
            let (index, mapping) = target.index();
            search_client(&config)?
                .recreate_index(index, &mapping)
                .await
                .with_context(|| format!("rebuilding index {index}"))?;
            println!("index rebuilt: {index}");
        }
        Commands::Resolve { base, prefix, latest_run } => {
            let resolver = SnapshotResolver::new(&base, prefix);
            let mut partition = resolver.resolve(config.snapshot_date)?;
            if latest_run {
                partition = resolver.resolve_latest_run(&partition)?;
            }
            println!("{}", partition.path.display());
        }
    }

    Ok(())
}

async fn connect_store(config: &PipelineConfig) -> Result<PgRawStore> {
    PgRawStore::connect(&config.database_url, Duration::from_secs(config.http_timeout_secs))
        .await
        .context("connecting to the raw store")
}

fn search_client(config: &PipelineConfig) -> Result<SearchClient> {
    Ok(SearchClient::new(SearchConfig {
        host: config.search_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?)
}

async fn run_load(config: &PipelineConfig, family: Option<&str>) -> Result<()> {
    let families: Vec<Box<dyn DocumentFamily>> = match family {
        Some(id) => vec![family_for_id(id)
            .with_context(|| format!("unknown family {id}; expected one of {}", FAMILY_IDS.join(", ")))?],
        None => all_families(),
    };

    let store = connect_store(config).await?;
    let reports = load_snapshot(&store, &config.raw_dir(), &families, config.snapshot_date).await?;
    for report in reports {
        println!(
            "loaded {} from {}: inserted={} updated={} skipped={} errors={}",
            report.table, report.partition, report.inserted, report.updated, report.skipped, report.errors
        );
    }
    Ok(())
}

fn run_format(config: &PipelineConfig) -> Result<()> {
    let weather = SnapshotResolver::new(config.weather_raw_dir(), FORMATTED_PREFIX).resolve(config.snapshot_date)?;
    let report = format_weather_partition(&weather, &config.weather_formatted_dir())
        .with_context(|| format!("formatting weather partition {weather}"))?;
    println!(
        "formatted {}: documents={} rows={} skipped={} errors={}",
        report.output, report.documents, report.rows, report.skipped, report.errors
    );

    let geography =
        SnapshotResolver::new(config.geography_raw_dir(), FORMATTED_PREFIX).resolve(config.snapshot_date)?;
    let report = format_geography_partition(&geography, &config.geography_formatted_dir())
        .with_context(|| format!("formatting geography partition {geography}"))?;
    println!(
        "formatted {}: documents={} rows={} skipped={} errors={}",
        report.output, report.documents, report.rows, report.skipped, report.errors
    );
    Ok(())
}

fn run_aggregate(config: &PipelineConfig) -> Result<()> {
    let weather =
        SnapshotResolver::new(config.weather_formatted_dir(), FORMATTED_PREFIX).resolve(config.snapshot_date)?;
    // Cities change slowly; the latest geography partition serves any weather date.
    let cities = SnapshotResolver::new(config.geography_formatted_dir(), FORMATTED_PREFIX).resolve_latest()?;

    let written = aggregate(&weather, &cities, &config.kpi_dir(), &ScoreModel::comfort())?;
    println!(
        "kpi partition {}: rows={} scored={}",
        written.partition, written.rows, written.scored
    );
    Ok(())
}

async fn run_publish(config: &PipelineConfig, target: Target) -> Result<()> {
    let (index, mapping) = target.index();
    let rows = match target {
        Target::Kpis => {
            let model = ScoreModel::comfort();
            let partition =
                SnapshotResolver::new(config.kpi_dir(), FORMATTED_PREFIX).resolve(config.snapshot_date)?;
            read_kpi_partition(&partition, &model)?
                .iter()
                .map(|row| kpi_search_row(row, &model))
                .collect::<Vec<_>>()
        }
        Target::Movies => movie_rows(config).await?.1,
        Target::MovieKpis => {
            let (date, movies) = movie_rows(config).await?;
            movie_kpi_summary_row(date, &movies).into_iter().collect()
        }
    };
    let id_columns: &[&str] = match target {
        Target::Kpis => &KPI_ID_COLUMNS,
        Target::Movies => &MOVIE_ID_COLUMNS,
        Target::MovieKpis => &MOVIE_KPI_ID_COLUMNS,
    };

    let client = search_client(config)?;
    client.ping().await?;
    let status = client.ensure_index(index, &mapping).await?;
    info!(index, ?status, "index ready");

    let report = client
        .publish(index, &rows, id_columns)
        .await
        .with_context(|| format!("publishing {} rows into {index}", rows.len()))?;
    client.refresh(index).await?;
    println!("published {}: docs={}", report.index, report.doc_count);
    Ok(())
}

/// Enriched movie rows for the configured (or latest loaded) snapshot date.
async fn movie_rows(config: &PipelineConfig) -> Result<(NaiveDate, Vec<SearchRow>)> {
    let store = connect_store(config).await?;
    let families = all_families();
    let table_for = |id: &str| {
        families
            .iter()
            .find(|f| f.family_id() == id)
            .map(|f| f.table().clone())
            .with_context(|| format!("family {id} is not registered"))
    };
    let details_table = table_for("tmdb_details")?;
    let ratings_table = table_for("omdb_ratings")?;
    let date = match config.snapshot_date {
        Some(date) => date,
        None => SnapshotResolver::new(config.raw_dir().join("tmdb/details"), "date")
            .resolve_latest()?
            .logical_date(),
    };
    let details = store.fetch_partition(&details_table, date).await?;
    let ratings = store.fetch_partition(&ratings_table, date).await?;
    Ok((date, movie_search_rows(&details, &ratings)))
}
