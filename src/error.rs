//! Error types for workrun.
//!
//! The taxonomy the rest of the crate works with: conflicts are expected
//! and absorbed where detected, transient storage failures are retried
//! under a budget, and only budget exhaustion escalates as `RunInvalid`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A row's version token changed between read and write. Expected under
    /// contention; the losing caller discards its batch and re-polls.
    #[error("optimistic conflict: row version changed since read")]
    OptimisticConflict,

    /// Connectivity/timeout-class storage failure injected by the in-memory
    /// store or synthesized for tests. Retryable under a budget.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Underlying database error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A retry budget was exhausted or setup failed before the run existed.
    /// Fatal: no partial-result guarantee once declared.
    #[error("run invalid: {0}")]
    RunInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A persisted value could not be mapped back to the model.
    #[error("corrupt store row: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure belongs to the connectivity/timeout class that
    /// bounded retry can recover from. Conflicts are not transient (they
    /// have their own recovery path) and logical failures never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Storage(e) => is_retryable_sqlx(e),
            _ => false,
        }
    }
}

/// Classify a sqlx error as retryable. Connection drops, timeouts, and
/// serialization failures (40001-class) may resolve on a later attempt;
/// anything else is treated as permanent.
fn is_retryable_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            db.code().as_deref() == Some("40001")
                || msg.contains("connection")
                || msg.contains("timeout")
                || msg.contains("server unavailable")
        }
        _ => {
            let msg = error.to_string();
            msg.contains("connection") || msg.contains("timed out") || msg.contains("broken pipe")
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("socket reset".into()).is_transient());
        assert!(Error::Storage(sqlx::Error::PoolTimedOut).is_transient());

        assert!(!Error::OptimisticConflict.is_transient());
        assert!(!Error::NotFound("run x".into()).is_transient());
        assert!(!Error::RunInvalid("budget exhausted".into()).is_transient());
        assert!(!Error::InvalidTransition {
            from: "done".into(),
            to: "pending".into()
        }
        .is_transient());
    }
}
