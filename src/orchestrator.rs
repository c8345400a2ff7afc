//! Run orchestrator: drives one run end to end.
//!
//! Owns the lifecycle state machine (Init -> GeneratorRunning ->
//! ProcessorRunning -> Done, Aborted from anywhere non-terminal) but never
//! the data path. The generator and processor run as independent tasks;
//! the orchestrator polls their completion without blocking the pool and
//! without cancelling them, and persists each transition under a bounded
//! retry budget against transient store failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventSink};
use crate::generator::{Generator, GeneratorConfig};
use crate::model::{Run, RunState};
use crate::processor::{ProcessStep, Processor, ProcessorConfig};
use crate::store::Store;

/// Configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Human label stored on the run row.
    pub label: String,
    pub generator: GeneratorConfig,
    pub processor: ProcessorConfig,
    /// Attempts to persist a lifecycle transition before the run is
    /// declared invalid.
    pub transition_retry_budget: u32,
    /// Backoff between transition attempts.
    pub transition_backoff: Duration,
    /// Poll interval while waiting for the worker tasks to finish.
    pub wait_poll: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            label: "workrun".to_string(),
            generator: GeneratorConfig::default(),
            processor: ProcessorConfig::default(),
            transition_retry_budget: 3000,
            transition_backoff: Duration::from_secs(5),
            wait_poll: Duration::from_secs(2),
        }
    }
}

/// What a completed (or aborted) run looked like.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: Run,
    pub generated: u64,
    pub processed: u64,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    step: Arc<dyn ProcessStep>,
    config: RunConfig,
    cancel_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn EventSink>,
        step: Arc<dyn ProcessStep>,
        config: RunConfig,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            store,
            sink,
            step,
            config,
            cancel_tx,
        }
    }

    /// Signal cooperative cancellation. Workers observe it at poll points;
    /// writes already issued complete or fail on their own terms.
    pub fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Drive one run to completion or fatal abort.
    pub async fn run(&self) -> Result<RunSummary> {
        let cancel = self.cancel_tx.subscribe();

        // Setup window: create the run row, reset the worklist, start both
        // workers. A store failure here invalidates the run outright; there
        // is no retry budget before the run exists.
        let mut run = match self.store.create_run(&self.config.label).await {
            Ok(run) => run,
            Err(e) => {
                error!(%e, "run creation failed");
                return Err(self.abort(None, format!("run creation failed: {e}")).await);
            }
        };
        info!(run_id = %run.id, label = %run.label, "run created");
        self.sink.emit(Event::now(EventKind::RunCreated {
            run_id: run.id,
            label: run.label.clone(),
        }));

        let removed = match self.store.clear_worklist().await {
            Ok(n) => n,
            Err(e) => {
                return Err(self
                    .abort(Some(run), format!("worklist reset failed: {e}"))
                    .await);
            }
        };
        self.sink
            .emit(Event::now(EventKind::WorklistCleared { removed }));

        let generator = Generator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            self.config.generator.clone(),
        );
        let gen_cancel = cancel.clone();
        let gen_handle = tokio::spawn(async move { generator.run(gen_cancel).await });

        let processor = Processor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            Arc::clone(&self.step),
            self.config.processor.clone(),
        );
        let paused = processor.pause_flag();
        let run_id = run.id;
        let proc_cancel = cancel.clone();
        let proc_handle = tokio::spawn(async move { processor.run(run_id, proc_cancel).await });

        // Still inside the setup window: this first transition is not
        // retried either.
        run.advance(RunState::GeneratorRunning)?;
        run = match self.store.update_run(&run).await {
            Ok(stored) => stored,
            Err(e) => {
                return Err(self
                    .abort(Some(run), format!("could not start run: {e}"))
                    .await);
            }
        };
        self.sink.emit(Event::now(EventKind::RunStateChanged {
            run_id: run.id,
            from: RunState::Init,
            to: RunState::GeneratorRunning,
        }));
        info!(run_id = %run.id, "generator and processor started");

        // Wait out the generator, then advance. The pending set only drains
        // once the persisted state says generation is over.
        let generated = match self.wait_task(gen_handle, &paused, "generator").await {
            Ok(n) => n,
            Err(e) => return Err(self.abort(Some(run), format!("generator failed: {e}")).await),
        };
        let run_id = run.id;
        run = match self
            .persist_transition(run, RunState::ProcessorRunning)
            .await
        {
            Ok(stored) => stored,
            Err(e) => return Err(self.abort_no_write(run_id, e).await),
        };
        info!(run_id = %run.id, generated, "generator finished");

        let processed = match self.wait_task(proc_handle, &paused, "processor").await {
            Ok(n) => n,
            Err(e) => return Err(self.abort(Some(run), format!("processor failed: {e}")).await),
        };

        if *cancel.borrow() {
            // Cancelled mid-run: the workers stopped at a poll point. The
            // run is left at its last persisted state rather than marked
            // Done with work outstanding.
            warn!(run_id = %run.id, "run cancelled; final transition skipped");
            return Ok(RunSummary {
                run,
                generated,
                processed,
            });
        }

        let run_id = run.id;
        run = match self.persist_transition(run, RunState::Done).await {
            Ok(stored) => stored,
            Err(e) => return Err(self.abort_no_write(run_id, e).await),
        };
        info!(run_id = %run.id, generated, processed, "run done");

        Ok(RunSummary {
            run,
            generated,
            processed,
        })
    }

    /// Poll a worker task until it finishes. Never cancels it.
    async fn wait_task(
        &self,
        handle: JoinHandle<Result<u64>>,
        paused: &Arc<AtomicBool>,
        what: &'static str,
    ) -> Result<u64> {
        loop {
            if handle.is_finished() {
                return match handle.await {
                    Ok(result) => result,
                    Err(join_error) => Err(Error::RunInvalid(format!(
                        "{what} task panicked: {join_error}"
                    ))),
                };
            }
            if paused.load(Ordering::Relaxed) {
                debug!(what, "worker reports paused");
            }
            tokio::time::sleep(self.config.wait_poll).await;
        }
    }

    /// Persist a lifecycle transition, retrying transient store failures
    /// under the transition budget. Logical failures (the row missing, an
    /// invalid transition, a version conflict on a row only this
    /// orchestrator writes) short-circuit immediately.
    async fn persist_transition(&self, mut run: Run, to: RunState) -> Result<Run> {
        let from = run.state;
        run.advance(to)?;

        let mut budget = self.config.transition_retry_budget;
        loop {
            match self.store.update_run(&run).await {
                Ok(stored) => {
                    self.sink.emit(Event::now(EventKind::RunStateChanged {
                        run_id: run.id,
                        from,
                        to,
                    }));
                    return Ok(stored);
                }
                Err(e) if e.is_transient() => {
                    budget = budget.saturating_sub(1);
                    if budget == 0 {
                        return Err(Error::RunInvalid(format!(
                            "transition {from} -> {to} retry budget exhausted: {e}"
                        )));
                    }
                    warn!(remaining = budget, %e, "transition write failed, retrying");
                    self.sink.emit(Event::now(EventKind::StorageRetry {
                        component: "orchestrator",
                        remaining: budget,
                    }));
                    tokio::time::sleep(self.config.transition_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Declare the run invalid: stop new work, write Aborted once
    /// (best-effort, never retried), emit the error event.
    async fn abort(&self, run: Option<Run>, reason: String) -> Error {
        self.shutdown();
        let run_id = run.as_ref().map(|r| r.id);
        if let Some(mut run) = run {
            if run.advance(RunState::Aborted).is_ok() {
                if let Err(e) = self.store.update_run(&run).await {
                    warn!(%e, "could not persist aborted state");
                }
            }
        }
        error!(?run_id, reason, "run invalid");
        self.sink
            .emit(Event::now(EventKind::RunAborted { run_id, reason: reason.clone() }));
        Error::RunInvalid(reason)
    }

    /// Abort path for an exhausted transition budget: the store is already
    /// refusing writes to this run, so no further write is attempted.
    async fn abort_no_write(&self, run_id: crate::model::RunId, cause: Error) -> Error {
        self.shutdown();
        let reason = cause.to_string();
        error!(%run_id, reason, "run invalid");
        self.sink.emit(Event::now(EventKind::RunAborted {
            run_id: Some(run_id),
            reason: reason.clone(),
        }));
        match cause {
            e @ Error::RunInvalid(_) => e,
            e => Error::RunInvalid(e.to_string()),
        }
    }
}
