//! Core data model.
//!
//! Two entities live in the store: work items (the units the generator
//! produces and the processor drains) and runs (one lifecycle record per
//! end-to-end execution). Both carry a version token the store bumps on
//! every successful write; claims and completions are keyed on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work in the shared worklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkItemId,

    /// Opaque payload label, assigned by the generator. Not a unique key:
    /// appending the same name twice yields two independent rows.
    pub name: String,

    /// Current lifecycle state.
    pub state: ProcessState,

    /// Optimistic-concurrency token. Bumped by the store on every write;
    /// compared on claim and completion. Never a business field.
    pub version: i64,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a work item. Transitions are monotonic: once claimed
/// an item never returns to Pending, and terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Appended by the generator, waiting to be claimed.
    Pending,
    /// Exclusively owned by one processor.
    Claimed,
    /// Processed successfully. Terminal.
    DoneOk,
    /// Processing step failed after its retry budget. Terminal.
    DoneError,
}

impl ProcessState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Pending, Claimed) | (Claimed, DoneOk) | (Claimed, DoneError)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::DoneOk | ProcessState::DoneError)
    }

    /// Wire value used by the store schema.
    pub fn as_i16(self) -> i16 {
        match self {
            ProcessState::Pending => 0,
            ProcessState::Claimed => 1,
            ProcessState::DoneOk => 2,
            ProcessState::DoneError => 3,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(ProcessState::Pending),
            1 => Ok(ProcessState::Claimed),
            2 => Ok(ProcessState::DoneOk),
            3 => Ok(ProcessState::DoneError),
            _ => Err(Error::Corrupt(format!("unknown work item state: {v}"))),
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Pending => "pending",
            ProcessState::Claimed => "claimed",
            ProcessState::DoneOk => "done_ok",
            ProcessState::DoneError => "done_error",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome of one item's processing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ItemOutcome {
    Ok,
    Error(String),
}

impl ItemOutcome {
    /// The terminal state this outcome maps to.
    pub fn terminal_state(&self) -> ProcessState {
        match self {
            ItemOutcome::Ok => ProcessState::DoneOk,
            ItemOutcome::Error(_) => ProcessState::DoneError,
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run row created, workers not yet started.
    Init,
    /// Generator task started; work may still arrive.
    GeneratorRunning,
    /// Generator finished; the pending set only drains from here on.
    ProcessorRunning,
    /// Processor finished, end timestamp set. Terminal.
    Done,
    /// A retry budget was exhausted or setup failed. Terminal.
    Aborted,
    /// Declared for operator tooling; nothing in this crate enters it.
    Paused,
}

impl RunState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Init, GeneratorRunning)
                | (GeneratorRunning, ProcessorRunning)
                | (ProcessorRunning, Done)
                | (GeneratorRunning, Paused)
                | (ProcessorRunning, Paused)
                | (Paused, GeneratorRunning)
                | (Paused, ProcessorRunning)
                | (Init, Aborted)
                | (GeneratorRunning, Aborted)
                | (ProcessorRunning, Aborted)
                | (Paused, Aborted)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }

    /// Wire value used by the store schema.
    pub fn as_i16(self) -> i16 {
        match self {
            RunState::Init => 0,
            RunState::GeneratorRunning => 1,
            RunState::ProcessorRunning => 2,
            RunState::Done => 3,
            RunState::Aborted => 4,
            RunState::Paused => 5,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(RunState::Init),
            1 => Ok(RunState::GeneratorRunning),
            2 => Ok(RunState::ProcessorRunning),
            3 => Ok(RunState::Done),
            4 => Ok(RunState::Aborted),
            5 => Ok(RunState::Paused),
            _ => Err(Error::Corrupt(format!("unknown run state: {v}"))),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Init => "init",
            RunState::GeneratorRunning => "generator_running",
            RunState::ProcessorRunning => "processor_running",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
            RunState::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Newtype for run IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// One end-to-end execution of the generate/process pipeline.
///
/// Created once by the orchestrator and mutated only by it; the generator
/// and processor are observed, they never report their own state here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,

    /// Human label for the run.
    pub label: String,

    /// Correlation token, unique per execution.
    pub correlation: Uuid,

    pub started_at: DateTime<Utc>,

    /// Set exactly when the run reaches Done.
    pub ended_at: Option<DateTime<Utc>>,

    pub state: RunState,

    /// Optimistic-concurrency token, same discipline as work items.
    pub version: i64,
}

impl Run {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            label: label.into(),
            correlation: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            state: RunState::Init,
            version: 0,
        }
    }

    /// Advance the run to `to`, validating the transition and keeping the
    /// end-timestamp invariant (`ended_at` is set iff the run is Done).
    pub fn advance(&mut self, to: RunState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        if to == RunState::Done {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}
