//! Checkpointed entity → children → grandchildren collection.
//!
//! Each stage is the same loop: page through one or more parents, turn the
//! records into snapshots, diff them against the latest persisted state and
//! commit snapshots, change-sets, debits and the advanced checkpoint in one
//! store transaction. A run resumes from whatever was last committed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::budget::BudgetLedger;
use crate::config::RunConfig;
use crate::delta::DeltaCalculator;
use crate::model::{
    ChangeSet, EntityKind, PartialReason, RawRecord, RunResult, RunStatus, Snapshot, Stage,
    StageKind, Stall, WorkflowCheckpoint,
};
use crate::paginate::{PageError, PageOutcome, PaginationDriver};
use crate::significance::RuleError;
use crate::store::{StageCommit, Store, StoreError};
use crate::youtube::FetchClient;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("checkpoint consistency violation: {0}")]
    CheckpointConsistency(String),
    #[error("invalid run configuration: {0}")]
    Config(#[from] RuleError),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<StoreError> for CollectError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Consistency(detail) => {
                error!(%detail, "checkpoint consistency violation");
                CollectError::CheckpointConsistency(detail)
            }
            StoreError::Backend(e) => CollectError::Storage(e),
        }
    }
}

const STAGES: [StageKind; 3] = [StageKind::Entity, StageKind::Children, StageKind::Grandchildren];

/// Runs collection workflows; one run per top-level identifier at a time.
pub struct Collector {
    client: Arc<dyn FetchClient>,
    store: Arc<dyn Store>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Collector {
    pub fn new(client: Arc<dyn FetchClient>, store: Arc<dyn Store>) -> Self {
        Self {
            client,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, entity_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(entity_id.to_string()).or_default().clone()
    }

    /// Forget the lock of `entity_id` once no other run holds or awaits it.
    async fn release(&self, entity_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if matches!(locks.get(entity_id), Some(l) if Arc::strong_count(l) == 1) {
            locks.remove(entity_id);
        }
    }

    /// Continue the latest unfinished run of `entity_id`, or start a new one.
    #[instrument(skip_all, fields(entity_id = %entity_id))]
    pub async fn start_or_resume_run(
        &self,
        entity_id: &str,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RunResult, CollectError> {
        let lock = self.lock_for(entity_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.run_exclusive(entity_id, config, cancel).await
        };
        self.release(entity_id, lock).await;
        result
    }

    async fn run_exclusive(
        &self,
        entity_id: &str,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RunResult, CollectError> {
        let delta = DeltaCalculator::from_config(config)?;
        let (checkpoint, baseline) = self.open_checkpoint(entity_id).await?;
        let driver = PaginationDriver::new(
            config.retry_policy(),
            config.request_timeout(),
            cancel.clone(),
        )
        .with_prior_spent(checkpoint.budget_spent);

        let mut run = Run {
            client: self.client.as_ref(),
            store: self.store.as_ref(),
            config,
            delta,
            driver,
            ledger: BudgetLedger::new(config.budget_ceiling),
            base_spent: checkpoint.budget_spent,
            committed_debits: 0,
            changesets: Vec::new(),
            baseline,
            checkpoint,
        };
        run.execute().await
    }

    async fn open_checkpoint(
        &self,
        entity_id: &str,
    ) -> Result<(WorkflowCheckpoint, bool), CollectError> {
        if let Some(mut cp) = self.store.latest_checkpoint_for(entity_id).await? {
            if cp.is_resumable() {
                let mut baseline = false;
                if cp.stage >= Stage::EntityFetched {
                    let entities = self
                        .store
                        .count_snapshots(&cp.run_id, EntityKind::Channel)
                        .await?;
                    if entities == 0 {
                        error!(
                            run_id = %cp.run_id,
                            stage = cp.stage.as_str(),
                            "checkpoint claims a committed entity that is not stored"
                        );
                        return Err(CollectError::CheckpointConsistency(format!(
                            "run {} is at {} but has no entity snapshot",
                            cp.run_id,
                            cp.stage.as_str()
                        )));
                    }
                    baseline = self.store.has_baseline(&cp.run_id, entity_id).await?;
                }
                info!(
                    run_id = %cp.run_id,
                    stage = cp.stage.as_str(),
                    cursor = cp.cursor.as_deref().unwrap_or(""),
                    "resuming run"
                );
                cp.status = None;
                cp.stall = None;
                return Ok((cp, baseline));
            }
        }

        let cp = WorkflowCheckpoint::new(Uuid::new_v4().to_string(), entity_id);
        self.store.save_checkpoint(&cp).await?;
        info!(run_id = %cp.run_id, "starting run");
        Ok((cp, false))
    }
}

enum StageEnd {
    Done,
    Stopped,
}

/// State of one invocation of a run.
struct Run<'a> {
    client: &'a dyn FetchClient,
    store: &'a dyn Store,
    config: &'a RunConfig,
    delta: DeltaCalculator,
    driver: PaginationDriver,
    ledger: BudgetLedger,
    /// Spent by earlier invocations of this run.
    base_spent: u64,
    committed_debits: usize,
    changesets: Vec<ChangeSet>,
    baseline: bool,
    checkpoint: WorkflowCheckpoint,
}

impl Run<'_> {
    async fn execute(&mut self) -> Result<RunResult, CollectError> {
        for stage in STAGES {
            if self.checkpoint.stage >= stage.completes_to() {
                continue;
            }
            if !self.enabled(stage) {
                break;
            }
            if let StageEnd::Stopped = self.run_stage(stage).await? {
                return Ok(self.result());
            }
        }
        self.finish().await
    }

    fn enabled(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Entity => true,
            StageKind::Children => self.config.child_fetch_enabled,
            StageKind::Grandchildren => {
                self.config.child_fetch_enabled && self.config.grandchild_fetch_enabled
            }
        }
    }

    fn parents(&self, stage: StageKind) -> Vec<String> {
        match stage {
            StageKind::Entity | StageKind::Children => vec![self.checkpoint.entity_id.clone()],
            StageKind::Grandchildren => self.checkpoint.pending_parents.clone(),
        }
    }

    async fn run_stage(&mut self, stage: StageKind) -> Result<StageEnd, CollectError> {
        let parents = self.parents(stage);
        info!(
            run_id = %self.checkpoint.run_id,
            stage = stage.as_str(),
            parents = parents.len(),
            "stage started"
        );

        for (i, parent) in parents.iter().enumerate() {
            let start = self.checkpoint.cursor.clone();
            let outcome = match self.fetch(stage, parent, start).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.abort(stage, &err).await?;
                    return Ok(StageEnd::Stopped);
                }
            };

            if stage == StageKind::Entity && outcome.partial.is_none() && outcome.records.is_empty() {
                warn!(run_id = %self.checkpoint.run_id, "entity not found upstream");
                self.stop(RunStatus::Aborted, stage, PartialReason::EntityMissing)
                    .await?;
                return Ok(StageEnd::Stopped);
            }

            let (snapshots, changesets) = self.materialize(stage, parent, outcome.records).await?;
            if stage == StageKind::Entity {
                self.baseline = changesets
                    .iter()
                    .any(|cs| cs.kind == EntityKind::Channel && cs.baseline);
            }
            if stage == StageKind::Children && self.enabled(StageKind::Grandchildren) {
                self.checkpoint
                    .pending_parents
                    .extend(snapshots.iter().map(|s| s.entity_id.clone()));
            }

            match outcome.partial {
                Some(reason) => {
                    warn!(
                        run_id = %self.checkpoint.run_id,
                        stage = stage.as_str(),
                        parent = %parent,
                        reason = reason.as_str(),
                        collected = snapshots.len(),
                        "stage stalled"
                    );
                    self.checkpoint.cursor = outcome.resume_cursor;
                    self.checkpoint.status = Some(RunStatus::PartiallyFailed);
                    self.checkpoint.stall = Some(Stall { stage, reason });
                    self.commit(snapshots, changesets).await?;
                    return Ok(StageEnd::Stopped);
                }
                None => {
                    self.checkpoint.cursor = None;
                    if stage == StageKind::Grandchildren && !self.checkpoint.pending_parents.is_empty() {
                        self.checkpoint.pending_parents.remove(0);
                    }
                    if i + 1 == parents.len() {
                        self.checkpoint.stage = stage.completes_to();
                    }
                    self.commit(snapshots, changesets).await?;
                }
            }
        }

        if parents.is_empty() {
            self.checkpoint.stage = stage.completes_to();
            self.commit(Vec::new(), Vec::new()).await?;
        }
        info!(
            run_id = %self.checkpoint.run_id,
            stage = stage.as_str(),
            spent = self.ledger.spent(),
            "stage committed"
        );
        Ok(StageEnd::Done)
    }

    async fn fetch(
        &mut self,
        stage: StageKind,
        parent: &str,
        start: Option<String>,
    ) -> Result<PageOutcome, PageError> {
        let client = self.client;
        let operation = stage.operation();
        self.driver
            .fetch_all(&mut self.ledger, parent, operation, start, |cursor| {
                client.fetch_page(parent, operation, cursor)
            })
            .await
    }

    /// Snapshots of the fetched records plus the change-sets worth keeping.
    ///
    /// A record already captured by this run (an earlier page, or an earlier
    /// commit of the run) is dropped.
    async fn materialize(
        &self,
        stage: StageKind,
        parent: &str,
        records: Vec<RawRecord>,
    ) -> Result<(Vec<Snapshot>, Vec<ChangeSet>), CollectError> {
        let collected_at = Utc::now();
        let mut seen = HashSet::with_capacity(records.len());
        let mut snapshots = Vec::with_capacity(records.len());
        let mut changesets = Vec::new();
        for mut record in records {
            if !seen.insert(record.id.clone()) {
                debug!(entity_id = %record.id, "duplicate record in fetched pages");
                continue;
            }
            if stage != StageKind::Entity && record.parent_id.is_none() {
                record.parent_id = Some(parent.to_string());
            }
            let snapshot = Snapshot::from_record(record, &self.checkpoint.run_id, collected_at);
            let previous = self.store.load_latest_snapshot(&snapshot.entity_id).await?;
            if matches!(&previous, Some(p) if p.run_id == snapshot.run_id) {
                debug!(entity_id = %snapshot.entity_id, "already captured by this run");
                continue;
            }
            let changeset = self.delta.diff(previous.as_ref(), &snapshot);
            if changeset.baseline || !changeset.is_empty() {
                changesets.push(changeset);
            }
            snapshots.push(snapshot);
        }
        Ok((snapshots, changesets))
    }

    async fn commit(
        &mut self,
        snapshots: Vec<Snapshot>,
        changesets: Vec<ChangeSet>,
    ) -> Result<(), CollectError> {
        self.checkpoint.budget_spent = self.base_spent + self.ledger.spent();
        self.checkpoint.updated_at = Utc::now();
        let commit = StageCommit {
            snapshots,
            changesets,
            checkpoint: self.checkpoint.clone(),
            debits: self.ledger.debits_since(self.committed_debits).to_vec(),
        };
        self.store.commit_stage(&commit).await?;
        self.committed_debits = self.ledger.debits().len();
        self.changesets.extend(commit.changesets);
        Ok(())
    }

    async fn stop(
        &mut self,
        status: RunStatus,
        stage: StageKind,
        reason: PartialReason,
    ) -> Result<(), CollectError> {
        self.checkpoint.status = Some(status);
        self.checkpoint.stall = Some(Stall { stage, reason });
        self.commit(Vec::new(), Vec::new()).await
    }

    async fn abort(&mut self, stage: StageKind, err: &PageError) -> Result<(), CollectError> {
        let status = if self.checkpoint.stage > Stage::NotStarted {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Aborted
        };
        error!(
            run_id = %self.checkpoint.run_id,
            stage = stage.as_str(),
            status = status.as_str(),
            error = %err,
            "run aborted by fetch failure"
        );
        self.stop(status, stage, PartialReason::RunAborted).await
    }

    async fn finish(&mut self) -> Result<RunResult, CollectError> {
        self.checkpoint.stage = Stage::Complete;
        self.checkpoint.status = Some(RunStatus::Success);
        self.checkpoint.stall = None;
        self.checkpoint.cursor = None;
        self.checkpoint.pending_parents.clear();
        self.commit(Vec::new(), Vec::new()).await?;
        info!(
            run_id = %self.checkpoint.run_id,
            spent = self.checkpoint.budget_spent,
            changesets = self.changesets.len(),
            "run complete"
        );
        Ok(self.result())
    }

    fn result(&self) -> RunResult {
        let stage = self.checkpoint.stage;
        let stages_completed = STAGES
            .into_iter()
            .filter(|s| self.enabled(*s) && stage >= s.completes_to())
            .collect();
        RunResult {
            run_id: self.checkpoint.run_id.clone(),
            entity_id: self.checkpoint.entity_id.clone(),
            status: self.checkpoint.status.unwrap_or(RunStatus::PartiallyFailed),
            stages_completed,
            changesets: self.changesets.clone(),
            budget_spent: self.checkpoint.budget_spent,
            stall: self.checkpoint.stall,
            baseline: self.baseline,
        }
    }
}
