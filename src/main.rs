use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use yt_watch::config;
use yt_watch::db;
use yt_watch::scheduler;
use yt_watch::store::SqliteStore;
use yt_watch::workflow::Collector;
use yt_watch::youtube::YoutubeClient;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Channel ids to collect instead of the configured list
    #[arg(long = "channel")]
    channels: Vec<String>,
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

    let client = match &cfg.youtube.base_url {
        Some(base) => {
            let url = Url::parse(base).with_context(|| format!("invalid youtube.base_url {base}"))?;
            YoutubeClient::with_base_url(cfg.youtube.api_key.clone(), url)?
        }
        None => YoutubeClient::new(cfg.youtube.api_key.clone())?,
    };
    let collector = Arc::new(Collector::new(
        Arc::new(client),
        Arc::new(SqliteStore::new(pool)),
    ));

    let channels = if args.channels.is_empty() {
        cfg.channels.clone()
    } else {
        args.channels
    };
    if channels.is_empty() {
        warn!("no channels configured; nothing to collect");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after current pages");
            on_signal.cancel();
        }
    });

    let outcomes =
        scheduler::run_many(collector, channels, &cfg.run, cfg.app.workers, &cancel).await;

    let mut failed = 0usize;
    let summary: Vec<_> = outcomes
        .iter()
        .map(|o| match &o.result {
            Ok(run) => json!({
                "entity_id": o.entity_id,
                "run_id": run.run_id,
                "status": run.status,
                "stages_completed": run.stages_completed,
                "budget_spent": run.budget_spent,
                "stall": run.stall,
                "baseline": run.baseline,
                "changesets": run.changesets.len(),
                "max_tier": run.changesets.iter().filter_map(|c| c.max_tier()).max(),
            }),
            Err(err) => {
                failed += 1;
                json!({ "entity_id": o.entity_id, "error": err.to_string() })
            }
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if failed > 0 {
        anyhow::bail!("{failed} channel(s) failed");
    }
    Ok(())
}
