//! Automation core for the flowcore platform.
//!
//! This crate provides:
//!
//! - **Event bus**: a synchronous, ordered pub/sub bus carrying the
//!   `automation:*`/`transform:*` topic vocabulary ([`bus`], [`events`]).
//! - **Workflow store**: CRUD over the deployed workflow set, enforcing the
//!   one-workflow-per-dataset invariant ([`workflow`]).
//! - **Run state**: the fold-from-events materialized view of one run, and
//!   its store ([`run_state`]).
//! - **Run queue**: a worker-pool-backed FIFO with cooperative per-run
//!   cancellation ([`queue`]).
//! - **Step runner**: ordered transform-step execution against a pluggable
//!   script engine registry ([`step_runner`]).
//! - **Policy**: a standalone allow/deny rule evaluator ([`policy`]).
//! - **Orchestrator**: the entry point wiring all of the above together with
//!   the trigger subsystem ([`orchestrator`]).

pub mod bus;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod policy;
pub mod queue;
pub mod run_state;
pub mod step_runner;
pub mod workflow;

pub use bus::{Bus, EventBus, NoopBus};
pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, RunFn, RunOutcome};
pub use queue::{CancelToken, RunQueue};
pub use run_state::{InMemoryRunStore, RunEvent, RunState, RunStore};
pub use step_runner::{ReferenceEngine, RunContext, ScriptEngine, Step};
pub use workflow::{FileWorkflowStore, InMemoryWorkflowStore, Workflow, WorkflowStore};
