//! Versioned store: the work queue and the coordination medium.
//!
//! The store is the only shared mutable resource in the pipeline. All
//! coordination between concurrent claimers happens through the per-row
//! version tokens: `try_claim` and `mark_terminal` write conditionally on
//! the version read earlier and fail the whole batch with
//! [`Error::OptimisticConflict`](crate::error::Error::OptimisticConflict)
//! if any row moved underneath. No locks, semaphores, or leases exist.

pub mod memory;
pub mod postgres;

pub use memory::{FaultOp, MemStore};
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ItemOutcome, Run, RunId, WorkItem};

#[async_trait]
pub trait Store: Send + Sync {
    /// Create a new run row in the Init state with a fresh correlation token.
    async fn create_run(&self, label: &str) -> Result<Run>;

    /// Persist a run, conditionally on its version token.
    ///
    /// Returns the stored run (version bumped). Fails with
    /// `OptimisticConflict` if the row's version moved since it was read
    /// and with `NotFound` if the row no longer exists; the latter is a
    /// logical failure that callers must not retry.
    async fn update_run(&self, run: &Run) -> Result<Run>;

    async fn get_run(&self, id: RunId) -> Result<Run>;

    /// Delete every work item. Performed once at run start; returns the
    /// number of rows removed.
    async fn clear_worklist(&self) -> Result<u64>;

    /// Append a chunk of new Pending items. Names are not unique keys;
    /// appending the same chunk twice yields independent rows.
    async fn append_work_items(&self, names: &[String]) -> Result<()>;

    /// Fetch up to `limit` items still in the Pending state.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<WorkItem>>;

    /// Atomically transition the whole batch Pending -> Claimed, keyed on
    /// each item's version token. Exactly one concurrent caller can win a
    /// given item; everyone else gets `OptimisticConflict` and nothing is
    /// written for them. Returns the claimed items with bumped versions.
    async fn try_claim(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>>;

    /// Transition claimed items to their terminal state (DoneOk/DoneError
    /// per outcome), under the same version-token discipline as `try_claim`.
    async fn mark_terminal(&self, outcomes: &[(WorkItem, ItemOutcome)]) -> Result<()>;
}
