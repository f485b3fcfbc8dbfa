//! Ordered step execution and the reference script engine.
//!
//! A run's steps are resolved and handed to [`run_transform`] one at a time:
//! each step's configured syntax selects a [`ScriptEngine`] from the engine
//! registry passed in. A step whose syntax is `"qri/save"` is a special
//! sentinel the runner itself recognizes and silently skips (no engine call,
//! no event); a step whose syntax matches no registered engine fails the run.
//! Once any step fails, every remaining step is reported skipped rather than run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcore_core::WorkflowRunId;

use crate::bus::{publish_id_value, EventBus};
use crate::error::StepRunnerError;
use crate::events::{
    topic, LogLevel, RunStatus, StepStatus, TransformErrorPayload, TransformPrintPayload, TransformStartPayload,
    TransformStepSkipPayload, TransformStepStartPayload, TransformStepStopPayload, TransformStopPayload,
};
use crate::queue::CancelToken;

/// A step's syntax sentinel that is silently ignored rather than executed.
pub const SAVE_SENTINEL_SYNTAX: &str = "qri/save";

/// One step of a workflow's transform script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub category: String,
    pub syntax: String,
    pub script: String,
}

/// Per-run scratch state a script engine reads and writes: global bindings,
/// the dataset body under construction, and the commit flag.
pub struct RunContext<'a> {
    run_id: WorkflowRunId,
    bus: &'a dyn EventBus,
    bindings: HashMap<String, Value>,
    body: Option<Value>,
    committed: bool,
}

impl<'a> RunContext<'a> {
    fn new(run_id: WorkflowRunId, bus: &'a dyn EventBus) -> Self {
        Self {
            run_id,
            bus,
            bindings: HashMap::new(),
            body: None,
            committed: false,
        }
    }

    pub fn set_binding(&mut self, key: impl Into<String>, value: Value) {
        self.bindings.insert(key.into(), value);
    }

    #[must_use]
    pub fn binding(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key)
    }

    pub fn set_body(&mut self, body: Value) {
        self.body = Some(body);
    }

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    #[must_use]
    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Marks the dataset body as ready to save.
    ///
    /// # Errors
    ///
    /// [`StepRunnerError::DoubleCommit`] if already called earlier in this run.
    pub fn commit(&mut self) -> Result<(), StepRunnerError> {
        if self.committed {
            return Err(StepRunnerError::DoubleCommit);
        }
        self.committed = true;
        Ok(())
    }

    pub fn print(&self, level: LogLevel, message: impl Into<String>) {
        let _ = publish_id_value(
            self.bus,
            topic::TRANSFORM_PRINT,
            &self.run_id.to_string(),
            &TransformPrintPayload {
                level,
                message: message.into(),
            },
        );
    }

    pub fn dataset_preview(&self, preview: Value) {
        let _ = publish_id_value(
            self.bus,
            topic::TRANSFORM_DATASET_PREVIEW,
            &self.run_id.to_string(),
            &crate::events::TransformDatasetPreviewPayload { preview },
        );
    }
}

/// A pluggable transform-script engine, selected by a step's `syntax` field.
pub trait ScriptEngine: Send + Sync {
    /// The syntax string this engine handles.
    fn syntax(&self) -> &'static str;

    /// Runs one step's script against the shared run context.
    ///
    /// # Errors
    ///
    /// Any [`StepRunnerError`] the script itself raises (e.g. `fail`).
    fn run_step(&self, ctx: &mut RunContext<'_>, step: &Step) -> Result<(), StepRunnerError>;
}

/// A minimal reference engine: one command per line.
///
/// - `print <message>` — emits an info-level print.
/// - `load` — marks the dataset as loaded (a no-op placeholder for a real
///   dataset-object binding, out of scope here).
/// - `set-body <json>` — parses the rest of the line as JSON and sets it as
///   the dataset body under construction.
/// - `commit` — marks the body ready to save.
/// - `fail <message>` — raises an engine error, failing the step.
pub struct ReferenceEngine;

/// The reference engine's syntax string.
pub const REFERENCE_SYNTAX: &str = "flowcore/reference";

impl ScriptEngine for ReferenceEngine {
    fn syntax(&self) -> &'static str {
        REFERENCE_SYNTAX
    }

    fn run_step(&self, ctx: &mut RunContext<'_>, step: &Step) -> Result<(), StepRunnerError> {
        for line in step.script.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "print" => ctx.print(LogLevel::Info, rest),
                "load" => ctx.set_binding("loaded", Value::Bool(true)),
                "set-body" => {
                    let value: Value = serde_json::from_str(rest.trim()).map_err(|e| StepRunnerError::Engine {
                        message: format!("set-body: invalid json: {e}"),
                    })?;
                    ctx.set_body(value);
                }
                "commit" => ctx.commit()?,
                "fail" => {
                    return Err(StepRunnerError::Engine {
                        message: rest.to_string(),
                    })
                }
                other => {
                    return Err(StepRunnerError::Engine {
                        message: format!("unrecognized reference command: {other}"),
                    })
                }
            }
        }
        Ok(())
    }
}

/// The terminal outcome of a full transform run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub status: RunStatus,
}

/// Runs every step in order against the registered engines, publishing the
/// full `transform:*` event sequence on `bus` scoped to `run_id`.
///
/// A step with syntax `"qri/save"` is silently skipped: no event is emitted
/// for it at all. Once any step fails, remaining steps are reported as
/// `transform:StepSkip` rather than run. Checked for cancellation between
/// steps; a cancellation mid-run reports `Failed`, matching any other
/// abnormal termination.
pub async fn run_transform(
    run_id: WorkflowRunId,
    bus: &dyn EventBus,
    steps: &[Step],
    engines: &HashMap<&'static str, Box<dyn ScriptEngine>>,
    cancel: &CancelToken,
) -> StepOutcome {
    let _ = publish_id_value(
        bus,
        topic::TRANSFORM_START,
        &run_id.to_string(),
        &TransformStartPayload { step_count: steps.len() },
    );

    let mut ctx = RunContext::new(run_id, bus);
    let mut failed = false;

    for step in steps {
        if step.syntax == SAVE_SENTINEL_SYNTAX {
            continue;
        }
        if cancel.is_canceled() {
            failed = true;
        }
        if failed {
            let _ = publish_id_value(
                bus,
                topic::TRANSFORM_STEP_SKIP,
                &run_id.to_string(),
                &TransformStepSkipPayload {
                    name: step.name.clone(),
                    category: step.category.clone(),
                },
            );
            continue;
        }

        let _ = publish_id_value(
            bus,
            topic::TRANSFORM_STEP_START,
            &run_id.to_string(),
            &TransformStepStartPayload {
                name: step.name.clone(),
                category: step.category.clone(),
            },
        );

        let status = match engines.get(step.syntax.as_str()) {
            Some(engine) => match engine.run_step(&mut ctx, step) {
                Ok(()) => StepStatus::Succeeded,
                Err(err) => {
                    let _ = publish_id_value(
                        bus,
                        topic::TRANSFORM_ERROR,
                        &run_id.to_string(),
                        &TransformErrorPayload {
                            level: LogLevel::Error,
                            message: err.to_string(),
                        },
                    );
                    failed = true;
                    StepStatus::Failed
                }
            },
            None => {
                let _ = publish_id_value(
                    bus,
                    topic::TRANSFORM_ERROR,
                    &run_id.to_string(),
                    &TransformErrorPayload {
                        level: LogLevel::Error,
                        message: StepRunnerError::UnrecognizedSyntax {
                            syntax: step.syntax.clone(),
                        }
                        .to_string(),
                    },
                );
                failed = true;
                StepStatus::Failed
            }
        };

        let _ = publish_id_value(
            bus,
            topic::TRANSFORM_STEP_STOP,
            &run_id.to_string(),
            &TransformStepStopPayload {
                name: step.name.clone(),
                category: step.category.clone(),
                status,
            },
        );
    }

    if !failed && !ctx.committed() {
        ctx.print(LogLevel::Warn, "no changes will be saved: commit was never called");
    }

    let overall = if failed { RunStatus::Failed } else { RunStatus::Succeeded };
    let _ = publish_id_value(
        bus,
        topic::TRANSFORM_STOP,
        &run_id.to_string(),
        &TransformStopPayload { status: overall },
    );

    StepOutcome { status: overall }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use std::sync::{Arc, Mutex};

    fn engines() -> HashMap<&'static str, Box<dyn ScriptEngine>> {
        let mut map: HashMap<&'static str, Box<dyn ScriptEngine>> = HashMap::new();
        map.insert(REFERENCE_SYNTAX, Box::new(ReferenceEngine));
        map
    }

    fn step(name: &str, script: &str) -> Step {
        Step {
            name: name.to_string(),
            category: "builtin".to_string(),
            syntax: REFERENCE_SYNTAX.to_string(),
            script: script.to_string(),
        }
    }

    #[tokio::test]
    async fn successful_run_commits_and_succeeds() {
        let bus = Bus::new();
        let steps = vec![step("load", "load\nset-body {\"rows\":1}\ncommit")];
        let outcome = run_transform(WorkflowRunId::new(), &bus, &steps, &engines(), &CancelToken::new()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn failing_step_skips_remaining_steps() {
        let bus = Bus::new();
        let topics_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = topics_seen.clone();
        bus.subscribe_all(Box::new(move |event| {
            seen.lock().unwrap().push(event.topic.clone());
            Ok(())
        }));

        let steps = vec![step("boom", "fail kaboom"), step("after", "print hi")];
        let outcome = run_transform(WorkflowRunId::new(), &bus, &steps, &engines(), &CancelToken::new()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(topics_seen.lock().unwrap().contains(&topic::TRANSFORM_STEP_SKIP.to_string()));
    }

    #[tokio::test]
    async fn unrecognized_syntax_fails_the_run() {
        let bus = Bus::new();
        let steps = vec![Step {
            name: "mystery".to_string(),
            category: "builtin".to_string(),
            syntax: "unknown/syntax".to_string(),
            script: String::new(),
        }];
        let outcome = run_transform(WorkflowRunId::new(), &bus, &steps, &engines(), &CancelToken::new()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn save_sentinel_step_is_silently_skipped() {
        let bus = Bus::new();
        let topics_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = topics_seen.clone();
        bus.subscribe_all(Box::new(move |event| {
            seen.lock().unwrap().push(event.topic.clone());
            Ok(())
        }));

        let steps = vec![Step {
            name: "save".to_string(),
            category: "builtin".to_string(),
            syntax: SAVE_SENTINEL_SYNTAX.to_string(),
            script: String::new(),
        }];
        let outcome = run_transform(WorkflowRunId::new(), &bus, &steps, &engines(), &CancelToken::new()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(!topics_seen.lock().unwrap().contains(&topic::TRANSFORM_STEP_START.to_string()));
    }

    #[test]
    fn double_commit_is_rejected() {
        let bus = Bus::new();
        let mut ctx = RunContext::new(WorkflowRunId::new(), &bus);
        ctx.commit().unwrap();
        assert!(matches!(ctx.commit(), Err(StepRunnerError::DoubleCommit)));
    }
}
