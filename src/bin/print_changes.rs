use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use yt_watch::config;
use yt_watch::db;
use yt_watch::model::{ChangeKind, Tier};

#[derive(Debug, Parser)]
#[command(author, version, about = "Print persisted change-sets of one entity or run, oldest first")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Channel, video or comment id
    #[arg(long, required_unless_present = "run", conflicts_with = "run")]
    entity: Option<String>,

    /// Every change-set recorded by one run
    #[arg(long)]
    run: Option<String>,

    /// Hide changes below this tier (minor, significant, critical)
    #[arg(long, default_value = "minor")]
    min_tier: String,

    /// Emit one JSON document per change-set instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let min_tier = Tier::parse_tier(&args.min_tier)
        .ok_or_else(|| anyhow!("unknown tier '{}'", args.min_tier))?;
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let (stored, label) = match (&args.entity, &args.run) {
        (Some(entity), _) => (db::list_changesets(&pool, entity).await?, entity.as_str()),
        (None, Some(run)) => (db::list_changesets_for_run(&pool, run).await?, run.as_str()),
        (None, None) => return Err(anyhow!("--entity or --run is required")),
    };
    if stored.is_empty() {
        eprintln!("no change-sets for {label}");
        return Ok(());
    }

    for row in stored {
        let mut cs = row.changeset;
        cs.changes.retain(|c| c.tier >= min_tier);
        if cs.changes.is_empty() && !cs.baseline {
            continue;
        }
        if args.json {
            println!("{}", serde_json::to_string(&cs)?);
            continue;
        }

        let since = cs
            .previous_collected_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "baseline".to_string());
        println!(
            "#{} {} {} run={} {} -> {}",
            row.id,
            cs.kind.as_str(),
            cs.entity_id,
            cs.run_id,
            since,
            cs.collected_at.to_rfc3339()
        );
        for change in &cs.changes {
            let value = |v: &Option<serde_json::Value>| {
                v.as_ref().map_or_else(|| "-".to_string(), |v| v.to_string())
            };
            match change.kind {
                ChangeKind::UnchangedContainer => {
                    println!("  [{}] {}/", change.tier.as_str(), change.path)
                }
                kind => println!(
                    "  [{}] {} {}: {} -> {}",
                    change.tier.as_str(),
                    kind.as_str(),
                    change.path,
                    value(&change.previous),
                    value(&change.new)
                ),
            }
        }
    }
    Ok(())
}
