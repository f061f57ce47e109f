use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RunConfig;
use crate::model::RunResult;
use crate::workflow::{CollectError, Collector};

/// Outcome of one identifier; order follows completion, not input.
#[derive(Debug)]
pub struct Scheduled {
    pub entity_id: String,
    pub result: Result<RunResult, CollectError>,
}

/// Collect every identifier, at most `workers` at a time.
///
/// Identifiers not yet started when `cancel` fires are skipped. Duplicates
/// are collected once.
pub async fn run_many(
    collector: Arc<Collector>,
    entity_ids: Vec<String>,
    config: &RunConfig,
    workers: usize,
    cancel: &CancellationToken,
) -> Vec<Scheduled> {
    let mut ids = entity_ids;
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));

    info!(count = ids.len(), workers, "scheduling collection");
    stream::iter(ids)
        .filter(|_| futures::future::ready(!cancel.is_cancelled()))
        .map(|entity_id| {
            let collector = collector.clone();
            async move {
                let result = collector
                    .start_or_resume_run(&entity_id, config, cancel)
                    .await;
                match &result {
                    Ok(run) => info!(
                        entity_id = %entity_id,
                        run_id = %run.run_id,
                        status = run.status.as_str(),
                        spent = run.budget_spent,
                        "collection finished"
                    ),
                    Err(err) => error!(entity_id = %entity_id, error = %err, "collection failed"),
                }
                Scheduled { entity_id, result }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}
