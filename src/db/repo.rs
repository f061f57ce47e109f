use super::model::{changeset_from_row, checkpoint_from_row, snapshot_from_row, StoredChangeSet};
use crate::model::{ChangeSet, Debit, EntityKind, OperationKind, Snapshot, WorkflowCheckpoint};
use anyhow::{anyhow, Context, Result};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{error, instrument};

pub type Pool = SqlitePool;

/// A checkpoint write that would lose or rewind durable progress.
#[derive(Debug, Error)]
#[error("checkpoint consistency violation: {0}")]
pub struct ConsistencyViolation(pub String);

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("connect {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx creates the file only when asked to.
    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn insert_snapshot_tx(tx: &mut Transaction<'_, Sqlite>, snapshot: &Snapshot) -> Result<()> {
    sqlx::query(
        "INSERT INTO snapshots (entity_id, kind, parent_id, run_id, fields, collected_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&snapshot.entity_id)
    .bind(snapshot.kind.as_str())
    .bind(snapshot.parent_id.as_deref())
    .bind(&snapshot.run_id)
    .bind(serde_json::to_string(&snapshot.fields)?)
    .bind(snapshot.collected_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_changeset_tx(tx: &mut Transaction<'_, Sqlite>, changeset: &ChangeSet) -> Result<()> {
    sqlx::query(
        "INSERT INTO changesets (entity_id, kind, run_id, previous_collected_at, collected_at, baseline, max_tier, changes) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&changeset.entity_id)
    .bind(changeset.kind.as_str())
    .bind(&changeset.run_id)
    .bind(changeset.previous_collected_at)
    .bind(changeset.collected_at)
    .bind(changeset.baseline as i64)
    .bind(changeset.max_tier().map(|t| t.as_str()))
    .bind(serde_json::to_string(&changeset.changes)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_debit_tx(tx: &mut Transaction<'_, Sqlite>, run_id: &str, debit: &Debit) -> Result<()> {
    sqlx::query("INSERT INTO budget_debits (run_id, operation, cost, at) VALUES (?, ?, ?, ?)")
        .bind(run_id)
        .bind(debit.operation.as_str())
        .bind(debit.cost as i64)
        .bind(debit.at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Stored stage rank of `run_id`, if the checkpoint row exists.
async fn stage_rank_tx(tx: &mut Transaction<'_, Sqlite>, run_id: &str) -> Result<Option<i64>> {
    let rank = sqlx::query_scalar::<_, i64>("SELECT stage_rank FROM checkpoints WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(rank)
}

async fn upsert_checkpoint_tx(
    tx: &mut Transaction<'_, Sqlite>,
    checkpoint: &WorkflowCheckpoint,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO checkpoints
            (run_id, entity_id, stage, stage_rank, cursor, pending_parents, status, stall_stage, stall_reason, budget_spent, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(run_id) DO UPDATE SET
            stage = excluded.stage,
            stage_rank = excluded.stage_rank,
            cursor = excluded.cursor,
            pending_parents = excluded.pending_parents,
            status = excluded.status,
            stall_stage = excluded.stall_stage,
            stall_reason = excluded.stall_reason,
            budget_spent = excluded.budget_spent,
            updated_at = excluded.updated_at"#,
    )
    .bind(&checkpoint.run_id)
    .bind(&checkpoint.entity_id)
    .bind(checkpoint.stage.as_str())
    .bind(checkpoint.stage.rank())
    .bind(checkpoint.cursor.as_deref())
    .bind(serde_json::to_string(&checkpoint.pending_parents)?)
    .bind(checkpoint.status.map(|s| s.as_str()))
    .bind(checkpoint.stall.map(|s| s.stage.as_str()))
    .bind(checkpoint.stall.map(|s| s.reason.as_str()))
    .bind(checkpoint.budget_spent as i64)
    .bind(checkpoint.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn check_forward(checkpoint: &WorkflowCheckpoint, stored_rank: i64) -> Result<()> {
    if checkpoint.stage.rank() < stored_rank {
        error!(
            run_id = %checkpoint.run_id,
            stored_rank,
            stage = checkpoint.stage.as_str(),
            "checkpoint would move backwards"
        );
        return Err(anyhow::Error::new(ConsistencyViolation(format!(
            "run {} cannot move back to {}",
            checkpoint.run_id,
            checkpoint.stage.as_str()
        ))));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn save_snapshot(pool: &Pool, snapshot: &Snapshot) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_snapshot_tx(&mut tx, snapshot).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn save_changeset(pool: &Pool, changeset: &ChangeSet) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_changeset_tx(&mut tx, changeset).await?;
    tx.commit().await?;
    Ok(())
}

/// Insert or advance a checkpoint. Never moves an existing one backwards.
#[instrument(skip_all)]
pub async fn save_checkpoint(pool: &Pool, checkpoint: &WorkflowCheckpoint) -> Result<()> {
    let mut tx = pool.begin().await?;
    if let Some(rank) = stage_rank_tx(&mut tx, &checkpoint.run_id).await? {
        check_forward(checkpoint, rank)?;
    }
    upsert_checkpoint_tx(&mut tx, checkpoint).await?;
    tx.commit().await?;
    Ok(())
}

/// Persist one stage's snapshots, change-sets and debits together with the
/// advanced checkpoint. Either everything lands or nothing does.
#[instrument(skip_all, fields(run_id = %checkpoint.run_id, stage = checkpoint.stage.as_str()))]
pub async fn commit_stage(
    pool: &Pool,
    snapshots: &[Snapshot],
    changesets: &[ChangeSet],
    checkpoint: &WorkflowCheckpoint,
    debits: &[Debit],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let Some(rank) = stage_rank_tx(&mut tx, &checkpoint.run_id).await? else {
        error!(run_id = %checkpoint.run_id, "commit for unknown checkpoint");
        return Err(anyhow::Error::new(ConsistencyViolation(format!(
            "no checkpoint for run {}",
            checkpoint.run_id
        ))));
    };
    check_forward(checkpoint, rank)?;

    for snapshot in snapshots {
        insert_snapshot_tx(&mut tx, snapshot).await?;
    }
    for changeset in changesets {
        insert_changeset_tx(&mut tx, changeset).await?;
    }
    for debit in debits {
        insert_debit_tx(&mut tx, &checkpoint.run_id, debit).await?;
    }
    upsert_checkpoint_tx(&mut tx, checkpoint).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_latest_snapshot(pool: &Pool, entity_id: &str) -> Result<Option<Snapshot>> {
    let row = sqlx::query(
        "SELECT entity_id, kind, parent_id, run_id, fields, collected_at FROM snapshots WHERE entity_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(snapshot_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn load_checkpoint(pool: &Pool, run_id: &str) -> Result<Option<WorkflowCheckpoint>> {
    let row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(checkpoint_from_row).transpose()
}

/// Most recently created checkpoint of an entity.
#[instrument(skip_all)]
pub async fn latest_checkpoint_for(pool: &Pool, entity_id: &str) -> Result<Option<WorkflowCheckpoint>> {
    let row = sqlx::query("SELECT * FROM checkpoints WHERE entity_id = ? ORDER BY rowid DESC LIMIT 1")
        .bind(entity_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(checkpoint_from_row).transpose()
}

pub async fn count_snapshots(pool: &Pool, run_id: &str, kind: EntityKind) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots WHERE run_id = ? AND kind = ?")
        .bind(run_id)
        .bind(kind.as_str())
        .fetch_one(pool)
        .await?;
    Ok(n.max(0) as u64)
}

pub async fn has_baseline(pool: &Pool, run_id: &str, entity_id: &str) -> Result<bool> {
    let found: i64 = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM changesets WHERE run_id = ? AND entity_id = ? AND baseline = 1)",
    )
    .bind(run_id)
    .bind(entity_id)
    .fetch_one(pool)
    .await?;
    Ok(found != 0)
}

/// Change-sets of an entity, oldest first.
pub async fn list_changesets(pool: &Pool, entity_id: &str) -> Result<Vec<StoredChangeSet>> {
    let rows = sqlx::query(
        "SELECT id, entity_id, kind, run_id, previous_collected_at, collected_at, baseline, changes FROM changesets WHERE entity_id = ? ORDER BY id",
    )
    .bind(entity_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(changeset_from_row).collect()
}

/// Change-sets of every entity collected under a channel run, oldest first.
pub async fn list_changesets_for_run(pool: &Pool, run_id: &str) -> Result<Vec<StoredChangeSet>> {
    let rows = sqlx::query(
        "SELECT id, entity_id, kind, run_id, previous_collected_at, collected_at, baseline, changes FROM changesets WHERE run_id = ? ORDER BY id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(changeset_from_row).collect()
}

pub async fn list_debits(pool: &Pool, run_id: &str) -> Result<Vec<Debit>> {
    let rows = sqlx::query("SELECT operation, cost, at FROM budget_debits WHERE run_id = ? ORDER BY id")
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| -> Result<Debit> {
            let op: String = row.get("operation");
            Ok(Debit {
                operation: OperationKind::parse_operation(&op)
                    .ok_or_else(|| anyhow!("unknown operation {op}"))?,
                cost: row.get::<i64, _>("cost").max(0) as u64,
                at: row.get("at"),
            })
        })
        .collect()
}
