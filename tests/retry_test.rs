//! Bounded-retry behavior under injected transient storage failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use workrun::error::Error;
use workrun::event::{CollectingSink, EventKind};
use workrun::generator::GeneratorConfig;
use workrun::model::{ProcessState, Run, RunState, WorkItem};
use workrun::orchestrator::{Orchestrator, RunConfig};
use workrun::processor::{ProcessStep, Processor, ProcessorConfig};
use workrun::store::{FaultOp, MemStore, Store};

struct InstantStep;

#[async_trait::async_trait]
impl ProcessStep for InstantStep {
    async fn process(&self, _item: &WorkItem) -> Result<(), String> {
        Ok(())
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

fn processor_config(retry_budget: u32) -> ProcessorConfig {
    ProcessorConfig {
        batch_size: 100,
        poll_interval: Duration::from_millis(10),
        retry_budget,
        retry_backoff: Duration::from_millis(1),
        item_attempts: 2,
        item_backoff: Duration::from_millis(1),
    }
}

async fn run_in_state(store: &MemStore, state: RunState) -> Run {
    let mut run = store.create_run("retry-test").await.unwrap();
    for next in [RunState::GeneratorRunning, RunState::ProcessorRunning] {
        if run.state == state {
            break;
        }
        run.advance(next).unwrap();
        run = store.update_run(&run).await.unwrap();
    }
    run
}

#[tokio::test]
async fn processor_survives_failures_one_short_of_the_budget() {
    let store = Arc::new(MemStore::new());
    store
        .append_work_items(&vec!["unit".to_string(); 10])
        .await
        .unwrap();
    let run = run_in_state(&store, RunState::ProcessorRunning).await;

    // 29 consecutive poll failures against a budget of 30: the run
    // recovers on the 30th attempt and finishes normally.
    store.fail_next(FaultOp::FetchPending, 29);

    let sink = Arc::new(CollectingSink::new());
    let processor = Processor::new(
        store.clone(),
        sink.clone(),
        Arc::new(InstantStep),
        processor_config(30),
    );

    let processed = processor.run(run.id, no_cancel()).await.unwrap();

    assert_eq!(processed, 10);
    assert!(store
        .items()
        .iter()
        .all(|i| i.state == ProcessState::DoneOk));
    let retries = sink.count_matching(|k| {
        matches!(
            k,
            EventKind::StorageRetry {
                component: "processor",
                ..
            }
        )
    });
    assert_eq!(retries, 29);
}

#[tokio::test]
async fn processor_gives_up_when_the_budget_is_exhausted() {
    let store = Arc::new(MemStore::new());
    store
        .append_work_items(&vec!["unit".to_string(); 10])
        .await
        .unwrap();
    let run = run_in_state(&store, RunState::ProcessorRunning).await;

    store.fail_next(FaultOp::FetchPending, 30);

    let sink = Arc::new(CollectingSink::new());
    let processor = Processor::new(
        store.clone(),
        sink,
        Arc::new(InstantStep),
        processor_config(30),
    );

    let err = processor.run(run.id, no_cancel()).await.unwrap_err();
    assert!(matches!(err, Error::RunInvalid(_)));

    // Nothing was touched; the worklist is intact for a later run.
    assert!(store
        .items()
        .iter()
        .all(|i| i.state == ProcessState::Pending));
}

#[tokio::test]
async fn budget_resets_after_each_success() {
    let store = Arc::new(MemStore::new());
    store
        .append_work_items(&vec!["unit".to_string(); 4])
        .await
        .unwrap();
    let run = run_in_state(&store, RunState::ProcessorRunning).await;

    // Two bursts of failures, each under the budget on its own but over
    // it combined. A success in between must reset the counter.
    store.fail_next(FaultOp::FetchPending, 2);

    let sink = Arc::new(CollectingSink::new());
    let processor = Processor::new(
        store.clone(),
        sink,
        Arc::new(InstantStep),
        processor_config(3),
    );

    let processed = processor.run(run.id, no_cancel()).await.unwrap();
    assert_eq!(processed, 4);

    // Second burst against a fresh worklist and the same budget.
    store
        .append_work_items(&vec!["unit".to_string(); 4])
        .await
        .unwrap();
    store.fail_next(FaultOp::FetchPending, 2);
    let processed = processor.run(run.id, no_cancel()).await.unwrap();
    assert_eq!(processed, 4);
}

#[tokio::test]
async fn empty_worklist_means_wait_while_generation_is_running() {
    let store = Arc::new(MemStore::new());
    let run = run_in_state(&store, RunState::GeneratorRunning).await;

    let processor = Processor::new(
        store.clone(),
        Arc::new(CollectingSink::new()),
        Arc::new(InstantStep),
        processor_config(30),
    );
    let run_id = run.id;
    let handle = tokio::spawn(async move { processor.run(run_id, no_cancel()).await });

    // Nothing pending and generation not finished: the processor sleeps
    // and re-polls instead of exiting.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!handle.is_finished());

    // Late work arrives and generation ends; the processor drains it.
    store
        .append_work_items(&vec!["late".to_string(); 5])
        .await
        .unwrap();
    let mut run = store.get_run(run.id).await.unwrap();
    run.advance(RunState::ProcessorRunning).unwrap();
    store.update_run(&run).await.unwrap();

    let processed = handle.await.unwrap().unwrap();
    assert_eq!(processed, 5);
    assert!(store
        .items()
        .iter()
        .all(|i| i.state == ProcessState::DoneOk));
}

#[tokio::test]
async fn zero_retry_budget_tolerates_no_failures() {
    let store = Arc::new(MemStore::new());
    store
        .append_work_items(&vec!["unit".to_string(); 5])
        .await
        .unwrap();
    let run = run_in_state(&store, RunState::ProcessorRunning).await;

    store.fail_next(FaultOp::FetchPending, 1);

    let processor = Processor::new(
        store,
        Arc::new(CollectingSink::new()),
        Arc::new(InstantStep),
        processor_config(0),
    );

    let err = processor.run(run.id, no_cancel()).await.unwrap_err();
    assert!(matches!(err, Error::RunInvalid(_)));
}

struct AlwaysFails;

#[async_trait::async_trait]
impl ProcessStep for AlwaysFails {
    async fn process(&self, _item: &WorkItem) -> Result<(), String> {
        Err("boom".to_string())
    }
}

#[tokio::test]
async fn zero_item_attempts_fail_items_on_first_error() {
    let store = Arc::new(MemStore::new());
    store
        .append_work_items(&vec!["unit".to_string(); 3])
        .await
        .unwrap();
    let run = run_in_state(&store, RunState::ProcessorRunning).await;

    let mut config = processor_config(30);
    config.item_attempts = 0;
    let processor = Processor::new(
        store.clone(),
        Arc::new(CollectingSink::new()),
        Arc::new(AlwaysFails),
        config,
    );

    let processed = processor.run(run.id, no_cancel()).await.unwrap();
    assert_eq!(processed, 3);
    assert!(store
        .items()
        .iter()
        .all(|i| i.state == ProcessState::DoneError));
}

fn orchestrator_config(transition_retry_budget: u32) -> RunConfig {
    RunConfig {
        label: "transition-retry".to_string(),
        generator: GeneratorConfig {
            target: 20,
            chunk_size: 10,
            interval: Duration::from_millis(20),
        },
        processor: processor_config(30),
        transition_retry_budget,
        transition_backoff: Duration::from_millis(1),
        wait_poll: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn transition_writes_retry_through_transient_failures() {
    let store = Arc::new(MemStore::new());
    let sink = Arc::new(CollectingSink::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        sink.clone(),
        Arc::new(InstantStep),
        orchestrator_config(5),
    );

    // Let setup (which is not retried) finish, then make the
    // GeneratorRunning -> ProcessorRunning write fail twice.
    let orch = tokio::spawn(async move { orchestrator.run().await });
    tokio::time::sleep(Duration::from_millis(15)).await;
    store.fail_next(FaultOp::UpdateRun, 2);

    let summary = orch.await.unwrap().unwrap();
    assert_eq!(summary.run.state, RunState::Done);
    assert_eq!(summary.processed, 20);

    let retries = sink.count_matching(|k| {
        matches!(
            k,
            EventKind::StorageRetry {
                component: "orchestrator",
                ..
            }
        )
    });
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn exhausted_transition_budget_aborts_without_further_writes() {
    let store = Arc::new(MemStore::new());
    let sink = Arc::new(CollectingSink::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        sink.clone(),
        Arc::new(InstantStep),
        orchestrator_config(3),
    );

    let orch = tokio::spawn(async move { orchestrator.run().await });
    tokio::time::sleep(Duration::from_millis(15)).await;
    store.fail_next(FaultOp::UpdateRun, 10);

    let err = orch.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::RunInvalid(_)));

    // The store was already refusing writes, so the abort is reported
    // without touching the run row: it stays at its last persisted state.
    let run_id = sink
        .events()
        .into_iter()
        .find_map(|e| match e.kind {
            EventKind::RunCreated { run_id, .. } => Some(run_id),
            _ => None,
        })
        .expect("run was created");
    let stored = store.get_run(run_id).await.unwrap();
    assert_eq!(stored.state, RunState::GeneratorRunning);

    let aborted = sink.count_matching(|k| matches!(k, EventKind::RunAborted { .. }));
    assert_eq!(aborted, 1);
}
