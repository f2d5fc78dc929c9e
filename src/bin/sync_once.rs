use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use gigwatch::cache::IdentifierCache;
use gigwatch::config;
use gigwatch::db;
use gigwatch::fetch::JsonFetcher;
use gigwatch::notify::{self, TelegramNotifier};
use gigwatch::sync::{run_cycle, EventsSync, ScrobbleSync};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Cycle {
    Events,
    Scrobbles,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Run a single sync cycle and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Which cycle to run
    #[arg(long, value_enum)]
    cycle: Cycle,

    /// Send reported (and previously unsent) events to Telegram
    #[arg(long)]
    notify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let http = JsonFetcher::new(&cfg.http.user_agent, cfg.request_timeout())?;

    match args.cycle {
        Cycle::Events => {
            let sync = EventsSync::from_config(pool.clone(), http, &cfg);
            let Some(report) = run_cycle(&sync).await else {
                bail!("events cycle aborted; see sync_log");
            };
            for event in &report.reported {
                info!(
                    event_id = event.event_id,
                    updated = event.updated,
                    title = %event.title,
                    "reported"
                );
            }
            if args.notify {
                let notifier = TelegramNotifier::from_config(&cfg);
                notify::deliver_backlog(&pool, &notifier, cfg.utc_offset()).await?;
            }
        }
        Cycle::Scrobbles => {
            let cache = Arc::new(IdentifierCache::new(cfg.cache_ttl()));
            let sync = ScrobbleSync::from_config(pool.clone(), http, cache, &cfg);
            let Some(report) = run_cycle(&sync).await else {
                bail!("scrobbles cycle aborted; see sync_log");
            };
            info!(
                stored = report.reported.len(),
                unchanged = report.unchanged,
                failures = report.partial_failures.len(),
                "scrobbles synced"
            );
        }
    }

    pool.close().await;
    Ok(())
}
