//! Core of the drover orchestrator: dependency-aware scheduling and
//! supervision of worker subprocesses over a shared feature catalog.
//!
//! The pieces, leaves first:
//!
//! - [`resolver`] -- pure dependency/readiness math over catalog rows.
//! - [`supervisor`] -- child process spawning, output streaming, reaping,
//!   and process-tree teardown.
//! - [`worker`] -- argv construction for the three worker roles.
//! - [`pools`] -- bounded coding/testing agent populations under one lock.
//! - [`debuglog`] -- the session debug log file.
//! - [`orchestrator`] -- the event-driven scheduler loop tying it together.

pub mod debuglog;
pub mod orchestrator;
pub mod pools;
pub mod resolver;
pub mod supervisor;
pub mod worker;

pub use orchestrator::{AgentStatus, Orchestrator, OrchestratorConfig, OrchestratorStatus};
