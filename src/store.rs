use async_trait::async_trait;
use thiserror::Error;

use crate::db::{self, ConsistencyViolation, Pool};
use crate::model::{ChangeSet, Debit, EntityKind, Snapshot, WorkflowCheckpoint};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The write would leave checkpoint and stage data out of step.
    #[error("{0}")]
    Consistency(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    fn from_backend(err: anyhow::Error) -> Self {
        match err.downcast::<ConsistencyViolation>() {
            Ok(violation) => StoreError::Consistency(violation.0),
            Err(other) => StoreError::Backend(other),
        }
    }
}

/// Everything one stage commit makes durable together.
#[derive(Debug, Clone)]
pub struct StageCommit {
    pub snapshots: Vec<Snapshot>,
    pub changesets: Vec<ChangeSet>,
    pub checkpoint: WorkflowCheckpoint,
    /// Ledger entries incurred since the previous commit.
    pub debits: Vec<Debit>,
}

impl StageCommit {
    /// A checkpoint-only commit.
    pub fn checkpoint(checkpoint: WorkflowCheckpoint) -> Self {
        Self {
            snapshots: Vec::new(),
            changesets: Vec::new(),
            checkpoint,
            debits: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_latest_snapshot(&self, entity_id: &str) -> Result<Option<Snapshot>, StoreError>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn save_changeset(&self, changeset: &ChangeSet) -> Result<(), StoreError>;

    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError>;

    async fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError>;

    /// Atomic: snapshots, change-sets, debits and the checkpoint land together
    /// or not at all. Rejects a missing or rewinding checkpoint.
    async fn commit_stage(&self, commit: &StageCommit) -> Result<(), StoreError>;

    async fn latest_checkpoint_for(
        &self,
        entity_id: &str,
    ) -> Result<Option<WorkflowCheckpoint>, StoreError>;

    async fn count_snapshots(&self, run_id: &str, kind: EntityKind) -> Result<u64, StoreError>;

    async fn list_changesets(&self, entity_id: &str) -> Result<Vec<ChangeSet>, StoreError>;

    /// Whether `run_id` recorded a baseline change-set for `entity_id`.
    async fn has_baseline(&self, run_id: &str, entity_id: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_latest_snapshot(&self, entity_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(db::load_latest_snapshot(&self.pool, entity_id).await?)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        Ok(db::save_snapshot(&self.pool, snapshot).await?)
    }

    async fn save_changeset(&self, changeset: &ChangeSet) -> Result<(), StoreError> {
        Ok(db::save_changeset(&self.pool, changeset).await?)
    }

    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        Ok(db::load_checkpoint(&self.pool, run_id).await?)
    }

    async fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        db::save_checkpoint(&self.pool, checkpoint)
            .await
            .map_err(StoreError::from_backend)
    }

    async fn commit_stage(&self, commit: &StageCommit) -> Result<(), StoreError> {
        db::commit_stage(
            &self.pool,
            &commit.snapshots,
            &commit.changesets,
            &commit.checkpoint,
            &commit.debits,
        )
        .await
        .map_err(StoreError::from_backend)
    }

    async fn latest_checkpoint_for(
        &self,
        entity_id: &str,
    ) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        Ok(db::latest_checkpoint_for(&self.pool, entity_id).await?)
    }

    async fn count_snapshots(&self, run_id: &str, kind: EntityKind) -> Result<u64, StoreError> {
        Ok(db::count_snapshots(&self.pool, run_id, kind).await?)
    }

    async fn list_changesets(&self, entity_id: &str) -> Result<Vec<ChangeSet>, StoreError> {
        let rows = db::list_changesets(&self.pool, entity_id).await?;
        Ok(rows.into_iter().map(|r| r.changeset).collect())
    }

    async fn has_baseline(&self, run_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        Ok(db::has_baseline(&self.pool, run_id, entity_id).await?)
    }
}
