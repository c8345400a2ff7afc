//! In-memory store.
//!
//! Same conflict semantics as the Postgres store, backed by plain maps.
//! Used by the integration tests and for local runs without a database.
//! Supports injecting transient failures per operation so retry and abort
//! paths can be exercised deterministically.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{ItemOutcome, ProcessState, Run, RunId, WorkItem, WorkItemId};

use super::Store;

/// Store operations that can have failures injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    CreateRun,
    UpdateRun,
    GetRun,
    ClearWorklist,
    AppendWorkItems,
    FetchPending,
    TryClaim,
    MarkTerminal,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, Run>,
    /// Insertion-ordered worklist; fetch_pending scans front to back.
    items: Vec<WorkItem>,
    /// Pending transient failures per operation.
    faults: HashMap<FaultOp, u32>,
    /// Successful claims per item, for at-most-once assertions.
    claim_wins: HashMap<WorkItemId, u32>,
}

/// In-memory [`Store`] with fault injection.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls of `op` fail with a transient storage error.
    pub fn fail_next(&self, op: FaultOp, n: u32) {
        self.lock().faults.insert(op, n);
    }

    /// How many times each item has been successfully claimed.
    pub fn claim_counts(&self) -> HashMap<WorkItemId, u32> {
        self.lock().claim_wins.clone()
    }

    /// Snapshot of the whole worklist, in insertion order.
    pub fn items(&self) -> Vec<WorkItem> {
        self.lock().items.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store poisoned")
    }

    fn check_fault(inner: &mut Inner, op: FaultOp) -> Result<()> {
        if let Some(n) = inner.faults.get_mut(&op) {
            if *n > 0 {
                *n -= 1;
                return Err(Error::Transient(format!("injected failure: {op:?}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_run(&self, label: &str) -> Result<Run> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::CreateRun)?;
        let run = Run::new(label);
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &Run) -> Result<Run> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::UpdateRun)?;
        let stored = inner
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| Error::NotFound(format!("run {}", run.id)))?;
        if stored.version != run.version {
            return Err(Error::OptimisticConflict);
        }
        let mut updated = run.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::GetRun)?;
        inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run {id}")))
    }

    async fn clear_worklist(&self) -> Result<u64> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::ClearWorklist)?;
        let removed = inner.items.len() as u64;
        inner.items.clear();
        inner.claim_wins.clear();
        Ok(removed)
    }

    async fn append_work_items(&self, names: &[String]) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::AppendWorkItems)?;
        for name in names {
            inner.items.push(WorkItem {
                id: WorkItemId::new(),
                name: name.clone(),
                state: ProcessState::Pending,
                version: 0,
            });
        }
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::FetchPending)?;
        Ok(inner
            .items
            .iter()
            .filter(|i| i.state == ProcessState::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_claim(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::TryClaim)?;

        // All-or-nothing: verify every version token before writing anything.
        for item in items {
            match inner.items.iter().find(|i| i.id == item.id) {
                Some(stored)
                    if stored.version == item.version
                        && stored.state == ProcessState::Pending => {}
                Some(_) => return Err(Error::OptimisticConflict),
                None => return Err(Error::OptimisticConflict),
            }
        }

        let mut claimed = Vec::with_capacity(items.len());
        for item in items {
            let stored = inner
                .items
                .iter_mut()
                .find(|i| i.id == item.id)
                .expect("verified above");
            stored.state = ProcessState::Claimed;
            stored.version += 1;
            claimed.push(stored.clone());
        }
        for item in &claimed {
            *inner.claim_wins.entry(item.id).or_insert(0) += 1;
        }
        Ok(claimed)
    }

    async fn mark_terminal(&self, outcomes: &[(WorkItem, ItemOutcome)]) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner, FaultOp::MarkTerminal)?;

        for (item, outcome) in outcomes {
            let stored = inner.items.iter().find(|i| i.id == item.id);
            let stored = match stored {
                Some(s) if s.version == item.version => s,
                _ => return Err(Error::OptimisticConflict),
            };
            let to = outcome.terminal_state();
            if !stored.state.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    from: stored.state.to_string(),
                    to: to.to_string(),
                });
            }
        }

        for (item, outcome) in outcomes {
            let stored = inner
                .items
                .iter_mut()
                .find(|i| i.id == item.id)
                .expect("verified above");
            stored.state = outcome.terminal_state();
            stored.version += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_bumps_version_and_blocks_stale_writers() {
        let store = MemStore::new();
        store
            .append_work_items(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let batch = store.fetch_pending(10).await.unwrap();
        assert_eq!(batch.len(), 2);

        let claimed = store.try_claim(&batch).await.unwrap();
        assert!(claimed.iter().all(|i| i.state == ProcessState::Claimed));
        assert!(claimed.iter().all(|i| i.version == 1));

        // A second claim with the stale version tokens must lose.
        let err = store.try_claim(&batch).await.unwrap_err();
        assert!(matches!(err, Error::OptimisticConflict));
    }

    #[tokio::test]
    async fn conflict_leaves_batch_untouched() {
        let store = MemStore::new();
        store
            .append_work_items(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        let batch = store.fetch_pending(10).await.unwrap();

        // Someone else claims just the middle item.
        store.try_claim(&batch[1..2]).await.unwrap();

        // The full-batch claim now conflicts, and the untouched items stay
        // Pending: they must reappear in a later fetch, not be skipped.
        let err = store.try_claim(&batch).await.unwrap_err();
        assert!(matches!(err, Error::OptimisticConflict));

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_names_are_independent_rows() {
        let store = MemStore::new();
        let chunk = vec!["same-name".to_string(); 3];
        store.append_work_items(&chunk).await.unwrap();
        store.append_work_items(&chunk).await.unwrap();

        assert_eq!(store.fetch_pending(100).await.unwrap().len(), 6);

        let removed = store.clear_worklist().await.unwrap();
        assert_eq!(removed, 6);
        assert!(store.fetch_pending(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_bounded() {
        let store = MemStore::new();
        store.fail_next(FaultOp::FetchPending, 2);

        assert!(store.fetch_pending(1).await.unwrap_err().is_transient());
        assert!(store.fetch_pending(1).await.unwrap_err().is_transient());
        assert!(store.fetch_pending(1).await.is_ok());
    }

    #[tokio::test]
    async fn update_run_checks_version_and_existence() {
        let store = MemStore::new();
        let run = store.create_run("test").await.unwrap();

        let updated = store.update_run(&run).await.unwrap();
        assert_eq!(updated.version, run.version + 1);

        // Stale token loses.
        let err = store.update_run(&run).await.unwrap_err();
        assert!(matches!(err, Error::OptimisticConflict));

        // Missing row is a logical failure, not a conflict.
        let mut ghost = Run::new("ghost");
        ghost.id = RunId::new();
        let err = store.update_run(&ghost).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
