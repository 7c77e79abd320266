use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "books-cli")]
#[command(about = "Books catalogue pipeline: collect, load and serve")]
struct Cli {
    /// Debug-level logs for the pipeline crates.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the catalogue and write the CSV export.
    Collect,
    /// Provision the warehouse objects and load the CSV export.
    Load,
    /// Collect, then load.
    Run,
    /// Serve the dashboard.
    Serve,
}

fn init_logger(verbose: bool) {
    let fallback = if verbose {
        "books_sync=debug,books_storage=debug,books_adapters=debug,books_warehouse=debug,books_web=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

async fn collect() -> Result<()> {
    let summary = books_sync::run_collect_from_env().await?;
    info!(
        run_id = %summary.run_id,
        pages = summary.pages_fetched,
        listings = summary.listings,
        export = %summary.export_path,
        "collect complete"
    );
    Ok(())
}

async fn load() -> Result<()> {
    let summary = books_sync::run_load_from_env().await?;
    info!(
        run_id = %summary.run_id,
        table = %summary.table,
        rows = summary.rows_copied,
        database_created = summary.database_created,
        "load complete"
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Collect => collect().await?,
        Commands::Load => load().await?,
        Commands::Run => {
            collect().await?;
            load().await?;
        }
        Commands::Serve => books_web::serve_from_env().await?,
    }

    Ok(())
}
