use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name -> value mapping of a collected entity.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Channel,
    Video,
    Comment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Channel => "channel",
            EntityKind::Video => "video",
            EntityKind::Comment => "comment",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(EntityKind::Channel),
            "video" => Some(EntityKind::Video),
            "comment" => Some(EntityKind::Comment),
            _ => None,
        }
    }
}

/// The three kinds of network-costing fetches the collector issues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FetchEntity,
    FetchChildPage,
    FetchGrandchildPage,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::FetchEntity => "fetch_entity",
            OperationKind::FetchChildPage => "fetch_child_page",
            OperationKind::FetchGrandchildPage => "fetch_grandchild_page",
        }
    }

    pub fn parse_operation(s: &str) -> Option<Self> {
        match s {
            "fetch_entity" => Some(OperationKind::FetchEntity),
            "fetch_child_page" => Some(OperationKind::FetchChildPage),
            "fetch_grandchild_page" => Some(OperationKind::FetchGrandchildPage),
            _ => None,
        }
    }
}

/// A record as returned by the fetch client, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub kind: EntityKind,
    pub parent_id: Option<String>,
    pub fields: Fields,
}

/// Immutable point-in-time capture of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: String,
    pub kind: EntityKind,
    pub parent_id: Option<String>,
    pub run_id: String,
    pub fields: Fields,
    pub collected_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn from_record(record: RawRecord, run_id: &str, collected_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: record.id,
            kind: record.kind,
            parent_id: record.parent_id,
            run_id: run_id.to_string(),
            fields: record.fields,
            collected_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    UnchangedContainer,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::UnchangedContainer => "unchanged_container",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Minor,
    Significant,
    Critical,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Minor => "minor",
            Tier::Significant => "significant",
            Tier::Critical => "critical",
        }
    }

    pub fn parse_tier(s: &str) -> Option<Self> {
        match s {
            "minor" => Some(Tier::Minor),
            "significant" => Some(Tier::Significant),
            "critical" => Some(Tier::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Dotted path, e.g. `statistics.viewCount`.
    pub path: String,
    pub previous: Option<Value>,
    pub new: Option<Value>,
    pub kind: ChangeKind,
    pub tier: Tier,
}

/// Field-level differences between two snapshots of the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entity_id: String,
    pub kind: EntityKind,
    pub run_id: String,
    pub previous_collected_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    /// First-ever collection of the entity; every field is reported as added.
    pub baseline: bool,
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn max_tier(&self) -> Option<Tier> {
        self.changes.iter().map(|c| c.tier).max()
    }
}

/// Workflow position. Ordered: a checkpoint only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    EntityFetched,
    ChildrenFetched,
    GrandchildrenFetched,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NotStarted => "not_started",
            Stage::EntityFetched => "entity_fetched",
            Stage::ChildrenFetched => "children_fetched",
            Stage::GrandchildrenFetched => "grandchildren_fetched",
            Stage::Complete => "complete",
        }
    }

    pub fn parse_stage(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Stage::NotStarted),
            "entity_fetched" => Some(Stage::EntityFetched),
            "children_fetched" => Some(Stage::ChildrenFetched),
            "grandchildren_fetched" => Some(Stage::GrandchildrenFetched),
            "complete" => Some(Stage::Complete),
            _ => None,
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Stage::NotStarted => 0,
            Stage::EntityFetched => 1,
            Stage::ChildrenFetched => 2,
            Stage::GrandchildrenFetched => 3,
            Stage::Complete => 4,
        }
    }
}

/// One phase of collection. `Stage` records which of these have been committed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Entity,
    Children,
    Grandchildren,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Entity => "entity",
            StageKind::Children => "children",
            StageKind::Grandchildren => "grandchildren",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "entity" => Some(StageKind::Entity),
            "children" => Some(StageKind::Children),
            "grandchildren" => Some(StageKind::Grandchildren),
            _ => None,
        }
    }

    /// Checkpoint stage reached once this stage is fully committed.
    pub fn completes_to(&self) -> Stage {
        match self {
            StageKind::Entity => Stage::EntityFetched,
            StageKind::Children => Stage::ChildrenFetched,
            StageKind::Grandchildren => Stage::GrandchildrenFetched,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            StageKind::Entity => EntityKind::Channel,
            StageKind::Children => EntityKind::Video,
            StageKind::Grandchildren => EntityKind::Comment,
        }
    }

    pub fn operation(&self) -> OperationKind {
        match self {
            StageKind::Entity => OperationKind::FetchEntity,
            StageKind::Children => OperationKind::FetchChildPage,
            StageKind::Grandchildren => OperationKind::FetchGrandchildPage,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartiallyFailed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "partially_failed" => Some(RunStatus::PartiallyFailed),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }
}

/// Why a stage stopped before exhausting its pages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    BudgetExhausted,
    FetchFailed,
    Cancelled,
    /// The external API rejected the whole run (auth, malformed data, quota gone).
    RunAborted,
    /// The top-level entity does not exist upstream.
    EntityMissing,
}

impl PartialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartialReason::BudgetExhausted => "budget_exhausted",
            PartialReason::FetchFailed => "fetch_failed",
            PartialReason::Cancelled => "cancelled",
            PartialReason::RunAborted => "run_aborted",
            PartialReason::EntityMissing => "entity_missing",
        }
    }

    pub fn parse_reason(s: &str) -> Option<Self> {
        match s {
            "budget_exhausted" => Some(PartialReason::BudgetExhausted),
            "fetch_failed" => Some(PartialReason::FetchFailed),
            "cancelled" => Some(PartialReason::Cancelled),
            "run_aborted" => Some(PartialReason::RunAborted),
            "entity_missing" => Some(PartialReason::EntityMissing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stall {
    pub stage: StageKind,
    pub reason: PartialReason,
}

/// Durable progress marker of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub run_id: String,
    pub entity_id: String,
    /// Last fully committed stage.
    pub stage: Stage,
    /// Cursor of the next page to fetch in the in-progress stage.
    pub cursor: Option<String>,
    /// Children whose grandchildren are still to be collected, in order.
    pub pending_parents: Vec<String>,
    /// `None` while the run is in progress.
    pub status: Option<RunStatus>,
    pub stall: Option<Stall>,
    /// Accumulated across every invocation of this run.
    pub budget_spent: u64,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    pub fn new(run_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entity_id: entity_id.into(),
            stage: Stage::NotStarted,
            cursor: None,
            pending_parents: Vec::new(),
            status: None,
            stall: None,
            budget_spent: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether a later invocation should continue this run instead of starting anew.
    pub fn is_resumable(&self) -> bool {
        self.stage != Stage::Complete && self.status != Some(RunStatus::Aborted)
    }
}

/// One ledger entry: cost is incurred when the call is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Debit {
    pub operation: OperationKind,
    pub cost: u64,
    pub at: DateTime<Utc>,
}

/// Structured outcome handed back to the caller of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub entity_id: String,
    pub status: RunStatus,
    pub stages_completed: Vec<StageKind>,
    pub changesets: Vec<ChangeSet>,
    /// Quota spent by this run across all of its invocations.
    pub budget_spent: u64,
    pub stall: Option<Stall>,
    /// The top-level entity was collected for the first time.
    pub baseline: bool,
}
