//! Run state: the materialized view of a run, folded from the sequence of
//! `transform:*` events it emits.
//!
//! `apply_event` is a pure function, the same fold-over-events idiom used
//! throughout this codebase for deriving current state from an append-only
//! log: given a state and one event, it returns the next state. The run
//! store's `add_event` is the only place that actually calls it against
//! live, persisted state.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcore_core::{WorkflowId, WorkflowRunId};

use crate::error::RunStoreError;
use crate::events::{LogLevel, RunStatus, StepStatus};

/// One line of output a step produced while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    Print { level: LogLevel, message: String },
    Error { level: LogLevel, message: String },
    DatasetPreview { preview: Value },
}

/// One step's materialized state within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub category: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub output: Vec<StepOutput>,
}

impl StepState {
    /// How long the step ran, if it has both started and stopped.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => Some(stop - start),
            _ => None,
        }
    }
}

/// The materialized state of one run: its status, timing, and the steps it
/// has executed so far, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepState>,
}

impl RunState {
    /// A fresh run state, not yet started.
    #[must_use]
    pub fn new(run_id: WorkflowRunId, workflow_id: WorkflowId) -> Self {
        Self {
            run_id,
            workflow_id,
            status: RunStatus::Waiting,
            started_at: None,
            stopped_at: None,
            steps: Vec::new(),
        }
    }

    /// How long the run took, if it has both started and stopped.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => Some(stop - start),
            _ => None,
        }
    }
}

/// A transform event in the shape `apply_event` folds over. Mirrors the
/// `transform:*` bus topics one-for-one.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Start { step_count: usize },
    StepStart { name: String, category: String },
    Print { level: LogLevel, message: String },
    Error { level: LogLevel, message: String },
    DatasetPreview { preview: Value },
    StepStop { status: StepStatus },
    StepSkip { name: String, category: String },
    Stop { status: RunStatus },
}

/// Folds one event into `state` at instant `now`, mutating it in place.
///
/// Events whose target step cannot be determined (a `Print`/`Error`/
/// `DatasetPreview`/`StepStop` with no steps yet started) are ignored rather
/// than treated as an error — a well-formed event stream never produces one,
/// and a malformed one should not be allowed to poison the fold.
pub fn apply_event(state: &mut RunState, event: RunEvent, now: DateTime<Utc>) {
    match event {
        RunEvent::Start { .. } => {
            state.status = RunStatus::Running;
            state.started_at = Some(now);
        }
        RunEvent::StepStart { name, category } => {
            state.steps.push(StepState {
                name,
                category,
                status: StepStatus::Running,
                started_at: Some(now),
                stopped_at: None,
                output: Vec::new(),
            });
        }
        RunEvent::Print { level, message } => {
            if let Some(step) = state.steps.last_mut() {
                step.output.push(StepOutput::Print { level, message });
            }
        }
        RunEvent::Error { level, message } => {
            if let Some(step) = state.steps.last_mut() {
                step.output.push(StepOutput::Error { level, message });
            }
        }
        RunEvent::DatasetPreview { preview } => {
            if let Some(step) = state.steps.last_mut() {
                step.output.push(StepOutput::DatasetPreview { preview });
            }
        }
        RunEvent::StepStop { status } => {
            if let Some(step) = state.steps.last_mut() {
                step.status = status;
                step.stopped_at = Some(now);
            }
        }
        RunEvent::StepSkip { name, category } => {
            state.steps.push(StepState {
                name,
                category,
                status: StepStatus::Skipped,
                started_at: None,
                stopped_at: Some(now),
                output: Vec::new(),
            });
        }
        RunEvent::Stop { status } => {
            state.status = status;
            state.stopped_at = Some(now);
        }
    }
}

/// Storage for run state, keyed by run id.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a fresh run state. Overwrites any existing state for the id.
    async fn create(&self, state: RunState) -> Result<(), RunStoreError>;

    /// Fetches the current state of a run.
    ///
    /// # Errors
    ///
    /// [`RunStoreError::NotFound`] if no such run exists.
    async fn get(&self, run_id: WorkflowRunId) -> Result<RunState, RunStoreError>;

    /// Folds `event` into the stored state for `run_id`.
    ///
    /// # Errors
    ///
    /// [`RunStoreError::NotFound`] if no such run exists.
    async fn add_event(&self, run_id: WorkflowRunId, event: RunEvent) -> Result<(), RunStoreError>;
}

/// An in-process [`RunStore`].
#[derive(Default)]
pub struct InMemoryRunStore {
    states: RwLock<HashMap<WorkflowRunId, RunState>>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, state: RunState) -> Result<(), RunStoreError> {
        self.states.write().expect("run store lock poisoned").insert(state.run_id, state);
        Ok(())
    }

    async fn get(&self, run_id: WorkflowRunId) -> Result<RunState, RunStoreError> {
        self.states
            .read()
            .expect("run store lock poisoned")
            .get(&run_id)
            .cloned()
            .ok_or(RunStoreError::NotFound { run_id })
    }

    async fn add_event(&self, run_id: WorkflowRunId, event: RunEvent) -> Result<(), RunStoreError> {
        let mut states = self.states.write().expect("run store lock poisoned");
        let state = states.get_mut(&run_id).ok_or(RunStoreError::NotFound { run_id })?;
        apply_event(state, event, Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn start_event_marks_running() {
        let mut state = RunState::new(WorkflowRunId::new(), WorkflowId::new());
        apply_event(&mut state, RunEvent::Start { step_count: 2 }, fixed_now());
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.started_at, Some(fixed_now()));
    }

    #[test]
    fn step_lifecycle_folds_in_order() {
        let mut state = RunState::new(WorkflowRunId::new(), WorkflowId::new());
        apply_event(&mut state, RunEvent::Start { step_count: 1 }, fixed_now());
        apply_event(
            &mut state,
            RunEvent::StepStart {
                name: "load".to_string(),
                category: "builtin".to_string(),
            },
            fixed_now(),
        );
        apply_event(
            &mut state,
            RunEvent::Print {
                level: LogLevel::Info,
                message: "loaded 10 rows".to_string(),
            },
            fixed_now(),
        );
        apply_event(&mut state, RunEvent::StepStop { status: StepStatus::Succeeded }, fixed_now());
        apply_event(&mut state, RunEvent::Stop { status: RunStatus::Succeeded }, fixed_now());

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].status, StepStatus::Succeeded);
        assert_eq!(state.steps[0].output.len(), 1);
    }

    #[test]
    fn step_skip_appends_skipped_step() {
        let mut state = RunState::new(WorkflowRunId::new(), WorkflowId::new());
        apply_event(
            &mut state,
            RunEvent::StepSkip {
                name: "transform".to_string(),
                category: "builtin".to_string(),
            },
            fixed_now(),
        );
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].status, StepStatus::Skipped);
    }

    #[test]
    fn print_with_no_started_step_is_ignored() {
        let mut state = RunState::new(WorkflowRunId::new(), WorkflowId::new());
        apply_event(
            &mut state,
            RunEvent::Print {
                level: LogLevel::Info,
                message: "stray".to_string(),
            },
            fixed_now(),
        );
        assert!(state.steps.is_empty());
    }

    #[tokio::test]
    async fn add_event_on_missing_run_is_not_found() {
        let store = InMemoryRunStore::new();
        let err = store
            .add_event(WorkflowRunId::new(), RunEvent::Start { step_count: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, RunStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = InMemoryRunStore::new();
        let run_id = WorkflowRunId::new();
        store.create(RunState::new(run_id, WorkflowId::new())).await.unwrap();
        let fetched = store.get(run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Waiting);
    }
}
