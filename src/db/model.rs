//! Row decoding for the repository.
//!
//! Enum columns are stored as their `as_str()` text and JSON-shaped columns
//! as serialized text. Decoding fails loudly on unknown values.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{
    ChangeSet, EntityKind, FieldChange, PartialReason, RunStatus, Snapshot, Stage, StageKind,
    Stall, WorkflowCheckpoint,
};

/// Change-set listing row for reports; carries the insert order.
#[derive(Debug, Clone)]
pub struct StoredChangeSet {
    pub id: i64,
    pub changeset: ChangeSet,
}

pub(crate) fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot> {
    let kind: String = row.get("kind");
    let fields: String = row.get("fields");
    Ok(Snapshot {
        entity_id: row.get("entity_id"),
        kind: EntityKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown entity kind {kind}"))?,
        parent_id: row.get("parent_id"),
        run_id: row.get("run_id"),
        fields: serde_json::from_str(&fields).context("decode snapshot fields")?,
        collected_at: row.get::<DateTime<Utc>, _>("collected_at"),
    })
}

pub(crate) fn changeset_from_row(row: &SqliteRow) -> Result<StoredChangeSet> {
    let kind: String = row.get("kind");
    let changes: String = row.get("changes");
    let changes: Vec<FieldChange> =
        serde_json::from_str(&changes).context("decode changeset changes")?;
    Ok(StoredChangeSet {
        id: row.get("id"),
        changeset: ChangeSet {
            entity_id: row.get("entity_id"),
            kind: EntityKind::parse_kind(&kind)
                .ok_or_else(|| anyhow!("unknown entity kind {kind}"))?,
            run_id: row.get("run_id"),
            previous_collected_at: row.get::<Option<DateTime<Utc>>, _>("previous_collected_at"),
            collected_at: row.get::<DateTime<Utc>, _>("collected_at"),
            baseline: row.get::<i64, _>("baseline") != 0,
            changes,
        },
    })
}

pub(crate) fn checkpoint_from_row(row: &SqliteRow) -> Result<WorkflowCheckpoint> {
    let run_id: String = row.get("run_id");
    let stage: String = row.get("stage");
    let pending: String = row.get("pending_parents");
    let status: Option<String> = row.get("status");
    let stall_stage: Option<String> = row.get("stall_stage");
    let stall_reason: Option<String> = row.get("stall_reason");

    let stall = match (stall_stage, stall_reason) {
        (Some(stage), Some(reason)) => Some(Stall {
            stage: StageKind::parse_kind(&stage)
                .ok_or_else(|| anyhow!("checkpoint {run_id} has unknown stall stage {stage}"))?,
            reason: PartialReason::parse_reason(&reason)
                .ok_or_else(|| anyhow!("checkpoint {run_id} has unknown stall reason {reason}"))?,
        }),
        _ => None,
    };
    let status = match status {
        Some(s) => Some(
            RunStatus::parse_status(&s)
                .ok_or_else(|| anyhow!("checkpoint {run_id} has unknown status {s}"))?,
        ),
        None => None,
    };

    Ok(WorkflowCheckpoint {
        entity_id: row.get("entity_id"),
        stage: Stage::parse_stage(&stage)
            .ok_or_else(|| anyhow!("checkpoint {run_id} has unknown stage {stage}"))?,
        cursor: row.get("cursor"),
        pending_parents: serde_json::from_str(&pending).context("decode pending parents")?,
        status,
        stall,
        budget_spent: row.get::<i64, _>("budget_spent").max(0) as u64,
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        run_id,
    })
}
