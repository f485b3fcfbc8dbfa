//! The event-bus topic vocabulary and the payload shapes that travel on it.
//!
//! Every topic is published with the affected run or workflow id as the
//! event's session id, so a subscriber can narrow to one id via
//! [`crate::bus::EventBus::subscribe_id`] without filtering payloads by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcore_core::{InitId, OwnerId, TriggerId, WorkflowId, WorkflowRunId};

/// Topic string constants, grouped by the subsystem that publishes them.
pub mod topic {
    pub const WORKFLOW_TRIGGER: &str = "automation:WorkflowTrigger";
    pub const WORKFLOW_STARTED: &str = "automation:WorkflowStarted";
    pub const WORKFLOW_STOPPED: &str = "automation:WorkflowStopped";
    pub const WORKFLOW_CREATED: &str = "automation:WorkflowCreated";
    pub const WORKFLOW_REMOVED: &str = "automation:WorkflowRemoved";
    pub const WORKFLOW_CANCELED: &str = "automation:WorkflowCanceled";
    pub const RUN_QUEUE_PUSH: &str = "automation:RunQueuePush";
    pub const RUN_QUEUE_POP: &str = "automation:RunQueuePop";
    pub const APPLY_QUEUE_PUSH: &str = "automation:ApplyQueuePush";
    pub const APPLY_QUEUE_POP: &str = "automation:ApplyQueuePop";
    pub const TRANSFORM_START: &str = "transform:Start";
    pub const TRANSFORM_STOP: &str = "transform:Stop";
    pub const TRANSFORM_STEP_START: &str = "transform:StepStart";
    pub const TRANSFORM_STEP_STOP: &str = "transform:StepStop";
    pub const TRANSFORM_STEP_SKIP: &str = "transform:StepSkip";
    pub const TRANSFORM_PRINT: &str = "transform:Print";
    pub const TRANSFORM_ERROR: &str = "transform:Error";
    pub const TRANSFORM_DATASET_PREVIEW: &str = "transform:DatasetPreview";
}

/// Overall terminal or in-flight status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Unchanged,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Severity for a `transform:Print`/`transform:Error` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Whether a queue entry is a run or an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Apply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTriggerPayload {
    pub owner_id: OwnerId,
    pub workflow_id: WorkflowId,
    pub trigger_id: TriggerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartedPayload {
    pub init_id: InitId,
    pub owner_id: OwnerId,
    pub workflow_id: WorkflowId,
    pub run_id: WorkflowRunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStoppedPayload {
    pub init_id: InitId,
    pub owner_id: OwnerId,
    pub workflow_id: WorkflowId,
    pub run_id: WorkflowRunId,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCreatedPayload {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRemovedPayload {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCanceledPayload {
    pub run_id: WorkflowRunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePushPayload {
    pub owner_id: OwnerId,
    pub init_id: InitId,
    pub run_id: WorkflowRunId,
    pub mode: RunMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePopPayload {
    pub run_id: WorkflowRunId,
    pub mode: RunMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStartPayload {
    pub step_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStepStartPayload {
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStepStopPayload {
    pub name: String,
    pub category: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStepSkipPayload {
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformPrintPayload {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformErrorPayload {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformDatasetPreviewPayload {
    pub preview: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStopPayload {
    pub status: RunStatus,
}

/// A bus event as delivered to a handler: topic, session id (empty for a
/// plain `publish`), the instant it was published, and its payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub session_id: String,
    pub published_at: DateTime<Utc>,
    pub payload: Value,
}
