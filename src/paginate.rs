use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::budget::BudgetLedger;
use crate::model::{OperationKind, PartialReason, RawRecord};
use crate::retry::{AttemptContext, RetryDecision, RetryPolicy};
use crate::youtube::{FetchError, Page};

#[derive(Debug, Error)]
pub enum PageError {
    /// The retry policy decided the run cannot continue.
    #[error("{operation} for {parent_id} aborted the run: {source}")]
    Fatal {
        parent_id: String,
        operation: &'static str,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOutcome {
    /// Records of every successful page, in page order.
    pub records: Vec<RawRecord>,
    /// `None` when the cursor chain was exhausted.
    pub partial: Option<PartialReason>,
    /// Cursor of the first page not fetched; `None` once exhausted.
    pub resume_cursor: Option<String>,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct PaginationDriver {
    policy: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
    /// Units spent by earlier invocations of the same run.
    prior_spent: u64,
}

impl PaginationDriver {
    pub fn new(policy: RetryPolicy, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            policy,
            timeout,
            cancel,
            prior_spent: 0,
        }
    }

    /// Continue a run that already issued calls in an earlier invocation.
    pub fn with_prior_spent(mut self, spent: u64) -> Self {
        self.prior_spent = spent;
        self
    }

    /// Fetch every page of `parent_id` starting at `start_cursor`.
    ///
    /// The ledger is consulted before each issued call, including retries.
    pub async fn fetch_all<F, Fut>(
        &self,
        ledger: &mut BudgetLedger,
        parent_id: &str,
        operation: OperationKind,
        start_cursor: Option<String>,
        mut fetch: F,
    ) -> Result<PageOutcome, PageError>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<Page, FetchError>>,
    {
        let mut outcome = PageOutcome::default();
        let mut cursor = start_cursor;
        let mut retries = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                debug!(parent_id, "pagination cancelled");
                return Ok(stop(outcome, cursor, PartialReason::Cancelled));
            }
            if !ledger.authorize(operation) || ledger.debit(operation).is_err() {
                debug!(
                    parent_id,
                    operation = operation.as_str(),
                    remaining = ledger.remaining(),
                    "budget exhausted"
                );
                return Ok(stop(outcome, cursor, PartialReason::BudgetExhausted));
            }
            // Nothing but this page's attempts has been issued by the run.
            let first_call_of_run = self.prior_spent == 0
                && outcome.pages == 0
                && ledger.debits().len() == retries as usize + 1;

            let result = match tokio::time::timeout(self.timeout, fetch(cursor.clone())).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::timeout(self.timeout)),
            };

            let err = match result {
                Ok(page) => {
                    outcome.pages += 1;
                    outcome.records.extend(page.records);
                    retries = 0;
                    match page.next_cursor.filter(|c| !c.is_empty()) {
                        Some(next) => {
                            cursor = Some(next);
                            continue;
                        }
                        None => {
                            outcome.resume_cursor = None;
                            return Ok(outcome);
                        }
                    }
                }
                Err(err) => err,
            };

            let ctx = AttemptContext {
                retries,
                has_partial_data: outcome.pages > 0,
                first_call_of_run,
            };
            match self.policy.classify(&err, &ctx) {
                RetryDecision::Retry(delay) => {
                    retries += 1;
                    warn!(
                        parent_id,
                        operation = operation.as_str(),
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed; retrying"
                    );
                    if self.cancel.is_cancelled() {
                        return Ok(stop(outcome, cursor, PartialReason::Cancelled));
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Ok(stop(outcome, cursor, PartialReason::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::AbortEntity => {
                    warn!(
                        parent_id,
                        operation = operation.as_str(),
                        pages = outcome.pages,
                        error = %err,
                        "fetch failed; giving up on entity"
                    );
                    return Ok(stop(outcome, cursor, PartialReason::FetchFailed));
                }
                RetryDecision::AbortRun => {
                    error!(
                        parent_id,
                        operation = operation.as_str(),
                        error = %err,
                        "fetch failed; aborting run"
                    );
                    return Err(PageError::Fatal {
                        parent_id: parent_id.to_string(),
                        operation: operation.as_str(),
                        source: err,
                    });
                }
            }
        }
    }
}

fn stop(mut outcome: PageOutcome, cursor: Option<String>, reason: PartialReason) -> PageOutcome {
    outcome.partial = Some(reason);
    outcome.resume_cursor = cursor;
    outcome
}
