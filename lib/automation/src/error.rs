//! Error types for the automation core.
//!
//! Each subsystem gets its own small hand-rolled enum (never derived via a
//! macro crate), each implementing `Display`/`std::error::Error` and exposing
//! a `kind()` accessor mapping onto the seven error kinds in
//! `flowcore_core::ErrorKind`. `OrchestratorError` is the top-level enum that
//! the lower-level errors convert into via `From`.

use std::fmt;

use flowcore_core::{ErrorKind, InitId, WorkflowId, WorkflowRunId};
use flowcore_triggers::{ListenerError, TriggerError};

/// Errors from the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A publish was attempted after the bus was closed.
    Closed,
    /// A subscriber handler returned an error, aborting delivery.
    Handler { topic: String, reason: String },
}

impl BusError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed => ErrorKind::BusClosed,
            Self::Handler { .. } => ErrorKind::TransformError,
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "publish on a closed bus"),
            Self::Handler { topic, reason } => {
                write!(f, "handler for topic '{topic}' failed: {reason}")
            }
        }
    }
}

impl std::error::Error for BusError {}

/// Errors from the workflow store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStoreError {
    /// No workflow exists with this id.
    NotFound { id: WorkflowId },
    /// No workflow exists for this dataset.
    NotFoundByInitId { init_id: InitId },
    /// A workflow already automates this dataset.
    DatasetAlreadyAutomated { init_id: InitId },
    /// An update attempted to change an immutable field.
    ImmutableFieldChanged { field: &'static str },
    /// The file backend failed to read or write its persistence file.
    Io { message: String },
}

impl WorkflowStoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::NotFoundByInitId { .. } => ErrorKind::NotFound,
            Self::DatasetAlreadyAutomated { .. } => ErrorKind::Conflict,
            Self::ImmutableFieldChanged { .. } => ErrorKind::Validation,
            Self::Io { .. } => ErrorKind::Validation,
        }
    }
}

impl fmt::Display for WorkflowStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "workflow not found: {id}"),
            Self::NotFoundByInitId { init_id } => {
                write!(f, "no workflow automates dataset: {init_id}")
            }
            Self::DatasetAlreadyAutomated { init_id } => {
                write!(f, "workflow for dataset exists: {init_id}")
            }
            Self::ImmutableFieldChanged { field } => {
                write!(f, "attempt to mutate immutable field: {field}")
            }
            Self::Io { message } => write!(f, "workflow store I/O error: {message}"),
        }
    }
}

impl std::error::Error for WorkflowStoreError {}

/// Errors from the run store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    /// No run state exists with this id.
    NotFound { run_id: WorkflowRunId },
    /// An update attempted to change the run's workflow id.
    WorkflowIdChanged { run_id: WorkflowRunId },
}

impl RunStoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::WorkflowIdChanged { .. } => ErrorKind::Validation,
        }
    }
}

impl fmt::Display for RunStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { run_id } => write!(f, "run state not found: {run_id}"),
            Self::WorkflowIdChanged { run_id } => {
                write!(f, "run {run_id} update changed workflow id")
            }
        }
    }
}

impl std::error::Error for RunStoreError {}

/// Errors from the run queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `pop` was called against an empty queue.
    Empty,
}

impl QueueError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "run queue is empty"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors raised by a step's script engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRunnerError {
    /// No engine is registered for this step's syntax.
    UnrecognizedSyntax { syntax: String },
    /// `commit` was called more than once in a single run.
    DoubleCommit,
    /// The run's scope was cancelled mid-step.
    Canceled,
    /// The script engine raised a runtime error.
    Engine { message: String },
}

impl StepRunnerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnrecognizedSyntax { .. } => ErrorKind::Validation,
            Self::DoubleCommit => ErrorKind::Conflict,
            Self::Canceled => ErrorKind::Canceled,
            Self::Engine { .. } => ErrorKind::TransformError,
        }
    }
}

impl fmt::Display for StepRunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedSyntax { syntax } => write!(f, "unrecognized step syntax: {syntax}"),
            Self::DoubleCommit => write!(f, "commit called more than once in this run"),
            Self::Canceled => write!(f, "run canceled"),
            Self::Engine { message } => write!(f, "transform error: {message}"),
        }
    }
}

impl std::error::Error for StepRunnerError {}

/// Errors from the policy rule grammar (§6, external interface).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// A rule's subject was empty.
    EmptySubject,
    /// A rule's resource path was empty.
    EmptyResource,
    /// A rule's action path was empty.
    EmptyAction,
    /// A wildcard segment appeared somewhere other than last.
    WildcardNotLast { field: &'static str },
}

impl PolicyError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySubject => write!(f, "rule subject must not be empty"),
            Self::EmptyResource => write!(f, "rule resource must not be empty"),
            Self::EmptyAction => write!(f, "rule action must not be empty"),
            Self::WildcardNotLast { field } => {
                write!(f, "wildcard segment in '{field}' must be last")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// Top-level orchestrator errors. Lower-level subsystem errors convert in via `From`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    Bus(BusError),
    WorkflowStore(WorkflowStoreError),
    RunStore(RunStoreError),
    Trigger(TriggerError),
    Listener(ListenerError),
    /// Two listeners were constructed for the same trigger type.
    DuplicateListenerKind { kind: &'static str },
    /// `runWorkflow`/`applyWorkflow` referenced an unknown workflow.
    WorkflowNotFound { id: WorkflowId },
    /// `start` was called after `stop`/`shutdown`.
    AlreadyStopped,
}

impl OrchestratorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bus(inner) => inner.kind(),
            Self::WorkflowStore(inner) => inner.kind(),
            Self::RunStore(inner) => inner.kind(),
            Self::Trigger(inner) => inner.kind(),
            Self::Listener(inner) => inner.kind(),
            Self::DuplicateListenerKind { .. } => ErrorKind::Validation,
            Self::WorkflowNotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyStopped => ErrorKind::Validation,
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(inner) => write!(f, "{inner}"),
            Self::WorkflowStore(inner) => write!(f, "{inner}"),
            Self::RunStore(inner) => write!(f, "{inner}"),
            Self::Trigger(inner) => write!(f, "{inner}"),
            Self::Listener(inner) => write!(f, "{inner}"),
            Self::DuplicateListenerKind { kind } => {
                write!(f, "duplicate listener registered for kind '{kind}'")
            }
            Self::WorkflowNotFound { id } => write!(f, "workflow not found: {id}"),
            Self::AlreadyStopped => write!(f, "orchestrator already stopped"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<BusError> for OrchestratorError {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}

impl From<WorkflowStoreError> for OrchestratorError {
    fn from(err: WorkflowStoreError) -> Self {
        Self::WorkflowStore(err)
    }
}

impl From<RunStoreError> for OrchestratorError {
    fn from(err: RunStoreError) -> Self {
        Self::RunStore(err)
    }
}

impl From<TriggerError> for OrchestratorError {
    fn from(err: TriggerError) -> Self {
        Self::Trigger(err)
    }
}

impl From<ListenerError> for OrchestratorError {
    fn from(err: ListenerError) -> Self {
        Self::Listener(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_closed_kind() {
        assert_eq!(BusError::Closed.kind(), ErrorKind::BusClosed);
    }

    #[test]
    fn workflow_store_conflict_kind() {
        let err = WorkflowStoreError::DatasetAlreadyAutomated {
            init_id: InitId::new("dataset_id"),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("workflow for dataset exists"));
    }

    #[test]
    fn step_runner_error_kinds() {
        assert_eq!(StepRunnerError::DoubleCommit.kind(), ErrorKind::Conflict);
        assert_eq!(StepRunnerError::Canceled.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn orchestrator_error_wraps_trigger_error() {
        let err: OrchestratorError = TriggerError::UnknownType {
            type_name: "webhook".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
