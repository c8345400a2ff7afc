//! Structured events emitted at lifecycle milestones.
//!
//! Every component receives an [`EventSink`] at construction; there is no
//! process-global event source. The default sink forwards to `tracing`,
//! and tests use [`CollectingSink`] to assert on what was emitted.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::model::{RunId, RunState, WorkItemId};

/// A structured event emitted by the pipeline. Serialized for log
/// payloads only; nothing reads events back.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunCreated {
        run_id: RunId,
        label: String,
    },
    RunStateChanged {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },
    RunAborted {
        run_id: Option<RunId>,
        reason: String,
    },
    WorklistCleared {
        removed: u64,
    },
    ChunkAppended {
        count: usize,
        total_generated: u64,
    },
    GeneratorFinished {
        generated: u64,
    },
    BatchClaimed {
        count: usize,
    },
    /// Another claimer won the race for part or all of a fetched batch.
    /// Expected under contention; the loser re-polls.
    ClaimConflict {
        count: usize,
    },
    BatchCompleted {
        ok: usize,
        failed: usize,
    },
    ItemFailed {
        id: WorkItemId,
        error: String,
    },
    /// A transient storage failure was absorbed; retries remain.
    StorageRetry {
        component: &'static str,
        remaining: u32,
    },
    ProcessorFinished {
        processed: u64,
    },
}

/// Injected sink for structured events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events to `tracing` at a level matching their severity.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event.kind {
            EventKind::RunAborted { run_id, reason } => {
                error!(?run_id, reason, "run aborted");
            }
            EventKind::ClaimConflict { count } => {
                warn!(count, "claim lost to a concurrent processor");
            }
            EventKind::StorageRetry {
                component,
                remaining,
            } => {
                warn!(component, remaining, "transient storage failure, retrying");
            }
            EventKind::ItemFailed { id, error } => {
                warn!(%id, error, "work item failed its processing step");
            }
            kind => match serde_json::to_string(kind) {
                Ok(payload) => info!(event = %payload, "lifecycle event"),
                Err(_) => info!(event = ?kind, "lifecycle event"),
            },
        }
    }
}

/// Records every event in memory. Test helper.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink poisoned").clone()
    }

    /// Count events matching a predicate on the kind.
    pub fn count_matching(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.events
            .lock()
            .expect("sink poisoned")
            .iter()
            .filter(|e| pred(&e.kind))
            .count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("sink poisoned").push(event);
    }
}
