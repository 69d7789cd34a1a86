use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lwt_ingest::{BackfillConfig, HeyReachClient};
use lwt_storage::{Store, DEFAULT_DATABASE_URL};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lwt-cli")]
#[command(about = "LinkedIn outreach webhook tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook receiver and query API.
    Serve,
    /// Replay accepted connections from a HeyReach campaign into the ledger.
    Backfill {
        /// Campaign to backfill from (overrides HEYREACH_CAMPAIGN_ID).
        #[arg(long)]
        campaign_id: Option<String>,
        /// Report what would be backfilled without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create database tables and indexes if they do not exist.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => lwt_web::serve_from_env().await?,
        Commands::Backfill {
            campaign_id,
            dry_run,
        } => backfill_command(campaign_id, dry_run).await?,
        Commands::Migrate => {
            let store = connect_store().await?;
            store.init_schema().await?;
            println!("database schema ready");
        }
    }

    Ok(())
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_store() -> Result<Store> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    Store::connect(&database_url)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

async fn backfill_command(campaign_id: Option<String>, dry_run: bool) -> Result<()> {
    let config = BackfillConfig::from_env();
    if config.api_key.is_empty() {
        bail!("HEYREACH_API_KEY not set in environment");
    }
    let Some(campaign_id) = campaign_id.or_else(|| config.campaign_id.clone()) else {
        bail!("campaign id not provided (use --campaign-id or set HEYREACH_CAMPAIGN_ID)");
    };

    let store = connect_store().await?;
    store.init_schema().await?;
    let client = HeyReachClient::new(&config)?;

    let summary = lwt_ingest::run_backfill(&store, &client, &campaign_id, dry_run).await?;
    println!(
        "backfill complete: run_id={} campaign={} leads={} accepted={} backfilled={} already_existed={}",
        summary.run_id,
        summary.campaign_id,
        summary.total_leads,
        summary.accepted,
        summary.backfilled,
        summary.already_existed
    );
    if summary.dry_run {
        println!("dry run: no changes were made to the database");
    }
    Ok(())
}
