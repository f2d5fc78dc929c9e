use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use gigwatch::cache::IdentifierCache;
use gigwatch::config;
use gigwatch::db;
use gigwatch::fetch::JsonFetcher;
use gigwatch::notify::{self, Notifier, TelegramNotifier};
use gigwatch::sync::{run_cycle, EventsSync, ScrobbleSync};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let cache = Arc::new(IdentifierCache::new(cfg.cache_ttl()));
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::from_config(&cfg));
    let offset = cfg.utc_offset();

    match notify::deliver_backlog(&pool, notifier.as_ref(), offset).await {
        Ok(n) if n > 0 => info!(delivered = n, "backlog delivered"),
        Ok(_) => {}
        Err(err) => error!(?err, "failed to deliver backlog"),
    }

    // Events schedule; every tick hands the unsent backlog to the notifier.
    let events = EventsSync::from_config(pool.clone(), http.clone(), &cfg);
    let events_every = Duration::from_secs(cfg.app.events_interval_secs);
    let events_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(events_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match notify::run_events_tick(&events, notifier.as_ref(), offset).await {
                Ok(n) if n > 0 => info!(delivered = n, "notifications sent"),
                Ok(_) => {}
                Err(err) => error!(?err, "notifier hand-off failed"),
            }
        }
    });

    // Listening history schedule.
    let scrobbles = ScrobbleSync::from_config(pool.clone(), http, cache, &cfg);
    let scrobbles_every = Duration::from_secs(cfg.app.scrobbles_interval_secs);
    let scrobbles_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scrobbles_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_cycle(&scrobbles).await;
        }
    });

    info!(
        events_every_secs = events_every.as_secs(),
        scrobbles_every_secs = scrobbles_every.as_secs(),
        "sync schedules started"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    events_task.abort();
    scrobbles_task.abort();
    pool.close().await;

    Ok(())
}
