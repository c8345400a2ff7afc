//! Work processor: the claim loop.
//!
//! Polls the store for pending items, claims batches exclusively through
//! the version-token protocol, runs the processing step, and marks each
//! item terminal. Conflicts are expected and cost nothing; transient
//! storage failures are retried under a bounded budget; exhausting the
//! budget invalidates the whole run, because claimed-but-unfinished items
//! must never be dropped silently.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventSink};
use crate::model::{ItemOutcome, RunId, RunState, WorkItem};
use crate::store::Store;

/// The processing step applied to each claimed item.
///
/// A step failure is a per-item outcome (the item ends DoneError after its
/// attempt budget), never a run-level failure.
#[async_trait]
pub trait ProcessStep: Send + Sync {
    async fn process(&self, item: &WorkItem) -> std::result::Result<(), String>;
}

/// Default step: a fixed cooperative delay standing in for real work.
pub struct DelayStep {
    pub delay: Duration,
}

impl Default for DelayStep {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ProcessStep for DelayStep {
    async fn process(&self, _item: &WorkItem) -> std::result::Result<(), String> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Configuration for one processor task.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum items fetched and claimed per batch.
    pub batch_size: usize,
    /// Sleep between polls when the pending set is empty but generation
    /// may still produce.
    pub poll_interval: Duration,
    /// Consecutive transient storage failures tolerated before the run is
    /// declared invalid. Resets on any successful store operation.
    pub retry_budget: u32,
    /// Backoff between transient-failure retries.
    pub retry_backoff: Duration,
    /// Processing-step attempts per item before it ends DoneError.
    pub item_attempts: u32,
    /// Backoff between processing-step attempts.
    pub item_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            poll_interval: Duration::from_secs(5),
            retry_budget: 30,
            retry_backoff: Duration::from_secs(5),
            item_attempts: 3,
            item_backoff: Duration::from_millis(200),
        }
    }
}

pub struct Processor {
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    step: Arc<dyn ProcessStep>,
    config: ProcessorConfig,
    paused: Arc<AtomicBool>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn EventSink>,
        step: Arc<dyn ProcessStep>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            sink,
            step,
            config,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pause flag observed by the orchestrator's wait loop. No code path
    /// raises it yet; it exists for operator tooling.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Drain the worklist for `run_id`. Returns the number of items this
    /// processor marked terminal.
    pub async fn run(&self, run_id: RunId, cancel: watch::Receiver<bool>) -> Result<u64> {
        let mut processed: u64 = 0;
        let mut budget = self.config.retry_budget;
        info!(retry_budget = budget, "processor started");

        loop {
            if *cancel.borrow() {
                info!(processed, "processor cancelled");
                break;
            }

            // Poll: run state first, then the pending set.
            let (run_state, items) = match self.poll(run_id).await {
                Ok(polled) => {
                    budget = self.config.retry_budget;
                    polled
                }
                Err(e) if e.is_transient() => {
                    self.spend_retry(&mut budget, &e)?;
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if items.is_empty() {
                if run_state == RunState::ProcessorRunning {
                    // Generation is finished and nothing is pending: drained.
                    break;
                }
                // Generation may still be producing; sleep and re-poll.
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            // A short batch while generation is finished is the last one.
            let last_batch =
                items.len() < self.config.batch_size && run_state == RunState::ProcessorRunning;

            let claimed = match self.store.try_claim(&items).await {
                Ok(claimed) => {
                    budget = self.config.retry_budget;
                    claimed
                }
                Err(Error::OptimisticConflict) => {
                    // Another claimer won part or all of this batch. Discard
                    // locally and re-poll immediately; this never spends the
                    // retry budget.
                    self.sink.emit(Event::now(EventKind::ClaimConflict {
                        count: items.len(),
                    }));
                    continue;
                }
                Err(e) if e.is_transient() => {
                    self.spend_retry(&mut budget, &e)?;
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!(count = claimed.len(), "batch claimed");
            self.sink.emit(Event::now(EventKind::BatchClaimed {
                count: claimed.len(),
            }));

            let outcomes = self.process_batch(&claimed).await;
            let ok = outcomes
                .iter()
                .filter(|(_, o)| matches!(o, ItemOutcome::Ok))
                .count();
            let failed = outcomes.len() - ok;

            self.mark_terminal_bounded(&outcomes, &mut budget).await?;
            processed += outcomes.len() as u64;

            self.sink
                .emit(Event::now(EventKind::BatchCompleted { ok, failed }));
            info!(processed, ok, failed, "batch completed");

            if last_batch {
                break;
            }
        }

        self.sink
            .emit(Event::now(EventKind::ProcessorFinished { processed }));
        Ok(processed)
    }

    async fn poll(&self, run_id: RunId) -> Result<(RunState, Vec<WorkItem>)> {
        let run = self.store.get_run(run_id).await?;
        let items = self.store.fetch_pending(self.config.batch_size).await?;
        Ok((run.state, items))
    }

    /// Apply the processing step to each claimed item, retrying per-item
    /// failures up to the item attempt budget.
    async fn process_batch(&self, items: &[WorkItem]) -> Vec<(WorkItem, ItemOutcome)> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let mut attempts = self.config.item_attempts;
            let outcome = loop {
                match self.step.process(item).await {
                    Ok(()) => break ItemOutcome::Ok,
                    Err(error) => {
                        attempts = attempts.saturating_sub(1);
                        if attempts == 0 {
                            self.sink.emit(Event::now(EventKind::ItemFailed {
                                id: item.id,
                                error: error.clone(),
                            }));
                            break ItemOutcome::Error(error);
                        }
                        warn!(id = %item.id, attempts, error, "processing step failed, retrying");
                        tokio::time::sleep(self.config.item_backoff).await;
                    }
                }
            };
            outcomes.push((item.clone(), outcome));
        }
        outcomes
    }

    /// Write terminal states for a claimed batch, retrying transient
    /// failures under the shared budget. A conflict here means another
    /// writer touched rows this processor owns exclusively, so the run's
    /// results can no longer be trusted.
    async fn mark_terminal_bounded(
        &self,
        outcomes: &[(WorkItem, ItemOutcome)],
        budget: &mut u32,
    ) -> Result<()> {
        loop {
            match self.store.mark_terminal(outcomes).await {
                Ok(()) => {
                    *budget = self.config.retry_budget;
                    return Ok(());
                }
                Err(Error::OptimisticConflict) => {
                    return Err(Error::RunInvalid(
                        "claimed items were modified by another writer".to_string(),
                    ));
                }
                Err(e) if e.is_transient() => {
                    self.spend_retry(budget, &e)?;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spend one unit of the transient retry budget, escalating to
    /// `RunInvalid` exactly when it runs out. A configured budget of zero
    /// tolerates no failures at all.
    fn spend_retry(&self, budget: &mut u32, error: &Error) -> Result<()> {
        *budget = budget.saturating_sub(1);
        if *budget == 0 {
            return Err(Error::RunInvalid(format!(
                "processor retry budget exhausted: {error}"
            )));
        }
        warn!(remaining = *budget, %error, "transient storage failure");
        self.sink.emit(Event::now(EventKind::StorageRetry {
            component: "processor",
            remaining: *budget,
        }));
        Ok(())
    }
}
