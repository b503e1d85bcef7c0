//! mycelium-exec - executor for planned coding-agent runs.
//!
//! Schedules planned tasks onto isolated worker workspaces, merges
//! successful results back into mainline, and gates every batch with the
//! project's doctor command. The run state is a durable, atomically-written
//! JSON document, so a killed process resumes where it stopped.

pub mod batch_engine;
pub mod budget;
pub mod command;
pub mod compliance;
pub mod git;
pub mod ledger;
pub mod logs;
pub mod paths;
pub mod policy;
pub mod run_engine;
pub mod signals;
pub mod state;
pub mod task_engine;
pub mod validators;
pub mod worker;
pub mod workspace;

pub use run_engine::{AppResult, RunEngine, RunOptions};
pub use signals::StopSignal;
pub use validators::{AgentCliClient, LlmClient};
