use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::error;
use sofia_merge::config::AppConfig;
use sofia_merge::pipeline;
use sofia_merge::store::PostgresStore;

/// Ingest source-finder output catalogs into a shared detection catalog,
/// merging duplicates across overlapping sky regions.
#[derive(Debug, Parser)]
#[command(name = "sofia-merge", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Source-finder parameter file(s)
    #[arg(required = true)]
    params: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)?;
    // Configuration errors are fatal before any worker starts.
    let thresholds = config.validate()?;

    let store = PostgresStore::connect(&config.database, config.datalink_url.clone()).await?;
    store.migrate().await?;

    pipeline::run_all(Arc::new(store), Arc::new(config), thresholds, cli.params).await
}
