//! # workrun
//!
//! Coordinates a work generator and one or more work processors through a
//! shared, versioned Postgres store acting as both the queue and the
//! coordination medium. Batches are claimed exclusively via per-row
//! optimistic version tokens instead of locks, and each end-to-end
//! execution is tracked as a run with a strict lifecycle state machine and
//! bounded-retry fatal-abort semantics.

pub mod config;
pub mod error;
pub mod event;
pub mod generator;
pub mod model;
pub mod orchestrator;
pub mod processor;
pub mod store;
pub mod telemetry;
