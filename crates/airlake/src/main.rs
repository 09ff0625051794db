use std::path::PathBuf;

use airlake_core::config::CurationConfig;
use airlake_core::engine::{open_stores, CurationEngine, CurationReport};
use airlake_core::store::TableSource;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Air-quality curation batch job", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the curated tables and replace them in the sink
    Curate(CurateArgs),
    /// List the source tables the job would read
    Tables(ConfigArgs),
    /// Run the curation in memory and print the first rows
    Preview(PreviewArgs),
}

#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct CurateArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Curate without writing anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long, default_value_t = 10)]
    rows: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Curate(args) => {
            let config = load_config(&args.config)?;
            let stores = open_stores(&config).await.context("failed to open stores")?;
            let engine = CurationEngine::new(config);

            let report = if args.dry_run {
                info!("dry run, nothing will be written");
                engine.curate(stores.source.as_ref()).await?.report
            } else {
                engine
                    .run(stores.source.as_ref(), stores.sink.as_ref())
                    .await
                    .context("curation run failed")?
            };
            print_skipped(&report);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Tables(args) => {
            let config = load_config(&args)?;
            let stores = open_stores(&config).await.context("failed to open stores")?;
            let names = stores.source.list_table_names().await?;

            let mut table = Table::new();
            table.set_header(vec!["table", "rows", "columns"]);
            for name in names {
                let frame = stores.source.load_table(&name).await?;
                table.add_row(vec![
                    name,
                    frame.height().to_string(),
                    frame.width().to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        Command::Preview(args) => {
            let config = load_config(&args.config)?;
            let stores = open_stores(&config).await.context("failed to open stores")?;
            let engine = CurationEngine::new(config);
            let output = engine.curate(stores.source.as_ref()).await?;

            println!("{}", output.curated.head(Some(args.rows)));
            print_skipped(&output.report);
            Ok(())
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<CurationConfig> {
    CurationConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "invalid default configuration".to_string(),
    })
}

fn print_skipped(report: &CurationReport) {
    if report.skipped.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.set_header(vec!["skipped table", "reason", "detail"]);
    for skipped in &report.skipped {
        table.add_row(vec![
            skipped.table.clone(),
            format!("{:?}", skipped.reason),
            skipped.detail.clone(),
        ]);
    }
    eprintln!("{table}");
}
