use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use evsync_storage::{EventQuery, PrimaryStore};
use evsync_sync::{SecondaryOutcome, SyncConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evsync")]
#[command(about = "Event catalog reconciliation and sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass over every enabled source.
    Sync,
    /// Push the primary store's rows to the secondary store without crawling.
    SyncExisting,
    /// Apply the primary store schema.
    Migrate,
    /// Print stored events as JSON lines.
    Events {
        #[arg(long)]
        source: Option<String>,
        /// Earliest start, `YYYY-MM-DD` or RFC 3339.
        #[arg(long, value_parser = parse_from)]
        from: Option<DateTime<Utc>>,
        /// Latest start, `YYYY-MM-DD` (inclusive) or RFC 3339.
        #[arg(long, value_parser = parse_to)]
        to: Option<DateTime<Utc>>,
        /// Case-insensitive match on title or venue.
        #[arg(long)]
        q: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
}

fn parse_instant(value: &str, end_of_day: bool) -> Result<DateTime<Utc>, String> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("expected YYYY-MM-DD or RFC 3339, got {value:?}"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| format!("invalid date {value:?}"))
}

fn parse_from(value: &str) -> Result<DateTime<Utc>, String> {
    parse_instant(value, false)
}

fn parse_to(value: &str) -> Result<DateTime<Utc>, String> {
    parse_instant(value, true)
}

/// Logs go to stderr so `events` output stays machine readable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evsync=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn report_secondary(outcome: &SecondaryOutcome) -> Result<()> {
    println!("secondary: {outcome}");
    if let SecondaryOutcome::Failed(err) = outcome {
        anyhow::bail!("secondary sync incomplete at step {}", err.step);
    }
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<PrimaryStore> {
    let store = PrimaryStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("applying primary schema")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = evsync_sync::run_pass_from_env().await?;
            for source in &summary.sources {
                println!(
                    "{}: raw={} merged={} dropped={} pruned={}{}",
                    source.source,
                    source.raw_events,
                    source.merged,
                    source.dropped,
                    source.pruned,
                    source
                        .crawl_error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
            println!(
                "primary: inserted={} updated={} unchanged={}",
                summary.upsert.inserted, summary.upsert.updated, summary.upsert.unchanged
            );
            report_secondary(&summary.secondary)?;
        }
        Commands::SyncExisting => {
            let outcome = evsync_sync::sync_existing_from_env().await?;
            report_secondary(&outcome)?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            open_store(&config).await?;
            println!("schema applied to {}", config.database_url);
        }
        Commands::Events {
            source,
            from,
            to,
            q,
            limit,
            offset,
        } => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            let rows = store
                .query(&EventQuery {
                    from,
                    to,
                    source,
                    text: q,
                    limit,
                    offset,
                })
                .await?;
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }

    Ok(())
}
