//! The orchestrator: the single entry point that ties the event bus,
//! workflow store, run store, trigger listeners, and run queue together.
//!
//! Mirrors the teacher's `Orchestrator<E: EventStore>` shape — one struct
//! behind an `Arc`, cheap to clone into spawned tasks, built from injected
//! trait objects rather than concrete types — generalized from one backing
//! event store to the full set of subsystems this platform needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use flowcore_core::{InitId, OwnerId, WorkflowId, WorkflowRunId};
use flowcore_triggers::listener::FiringRequest;
use flowcore_triggers::set::TriggerSource;
use flowcore_triggers::{Listener, TriggerEventPublisher, TriggerError, TriggerRegistry};

use crate::bus::{publish_id_value, publish_value, EventBus};
use crate::error::OrchestratorError;
use crate::events::{
    topic, WorkflowCreatedPayload, WorkflowRemovedPayload, WorkflowStartedPayload, WorkflowStoppedPayload,
    WorkflowTriggerPayload,
};
use crate::queue::{CancelToken, QueueTask, RunQueue};
use crate::run_state::{RunEvent, RunState, RunStore};
use crate::workflow::{Workflow, WorkflowStore};

/// A run or apply's outcome, produced by the injected run function and
/// classified into the run's terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    /// The transform ran to completion but produced no change worth saving.
    Unchanged,
    Failed,
}

impl RunOutcome {
    fn into_status(self) -> crate::events::RunStatus {
        use crate::events::RunStatus;
        match self {
            Self::Succeeded => RunStatus::Succeeded,
            Self::Unchanged => RunStatus::Unchanged,
            Self::Failed => RunStatus::Failed,
        }
    }
}

/// The function the orchestrator calls to actually execute a run or apply.
///
/// The reference implementation threads a request-scoped factory through
/// several layers to build this function per invocation; Rust has no
/// equivalent of that scope object, so this is flattened into a plain
/// closure capturing whatever per-call context it needs.
pub type RunFn = Arc<dyn Fn(Workflow, WorkflowRunId, CancelToken) -> BoxFuture<'static, RunOutcome> + Send + Sync>;

/// Bridges the trigger subsystem's publisher seam onto this orchestrator's
/// bus: a firing becomes an `automation:WorkflowTrigger` event.
struct BusTriggerPublisher {
    bus: Arc<dyn EventBus>,
}

impl TriggerEventPublisher for BusTriggerPublisher {
    fn publish_workflow_trigger(
        &self,
        owner_id: &OwnerId,
        workflow_id: &WorkflowId,
        trigger_id: flowcore_core::TriggerId,
    ) -> Result<(), flowcore_triggers::ListenerError> {
        publish_id_value(
            self.bus.as_ref(),
            topic::WORKFLOW_TRIGGER,
            &workflow_id.to_string(),
            &WorkflowTriggerPayload {
                owner_id: owner_id.clone(),
                workflow_id: *workflow_id,
                trigger_id,
            },
        )
        .map_err(|err| {
            flowcore_triggers::ListenerError::Trigger(TriggerError::InvalidConfig {
                type_name: String::new(),
                reason: err.to_string(),
            })
        })
    }
}

struct Inner {
    bus: Arc<dyn EventBus>,
    workflow_store: Arc<dyn WorkflowStore>,
    run_store: Option<Arc<dyn RunStore>>,
    listeners: HashMap<&'static str, Arc<dyn Listener>>,
    trigger_registry: TriggerRegistry,
    queue: Arc<RunQueue>,
    run_fn: RunFn,
    apply_fn: RunFn,
    started: AtomicBool,
    stopped: AtomicBool,
    refresh_lock: AsyncMutex<()>,
}

/// Orchestrates the workflow lifecycle: saving/removing deployed workflows,
/// keeping trigger listeners in sync with them, and dispatching runs/applies
/// onto the run queue in response to either a trigger firing or a direct call.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds a new orchestrator.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::DuplicateListenerKind`] if two listeners report the same [`Listener::kind`].
    pub fn new(
        bus: Arc<dyn EventBus>,
        workflow_store: Arc<dyn WorkflowStore>,
        run_store: Option<Arc<dyn RunStore>>,
        listeners: Vec<Arc<dyn Listener>>,
        trigger_registry: TriggerRegistry,
        queue: Arc<RunQueue>,
        run_fn: RunFn,
        apply_fn: RunFn,
    ) -> Result<Self, OrchestratorError> {
        let mut by_kind = HashMap::new();
        for listener in listeners {
            let kind = listener.kind();
            if by_kind.insert(kind, listener).is_some() {
                return Err(OrchestratorError::DuplicateListenerKind { kind });
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                bus,
                workflow_store,
                run_store,
                listeners: by_kind,
                trigger_registry,
                queue,
                run_fn,
                apply_fn,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                refresh_lock: AsyncMutex::new(()),
            }),
        })
    }

    /// A [`TriggerEventPublisher`] wired to `bus`, suitable for constructing a
    /// [`flowcore_triggers::RuntimeListener`] or [`flowcore_triggers::CronListener`]
    /// before calling [`Orchestrator::new`].
    #[must_use]
    pub fn trigger_publisher(bus: Arc<dyn EventBus>) -> Arc<dyn TriggerEventPublisher> {
        Arc::new(BusTriggerPublisher { bus })
    }

    /// Saves (creates or updates) a workflow: each trigger config is
    /// normalized by round-tripping it through its listener, then the record
    /// is written to the store and listeners are refreshed in the background.
    ///
    /// # Errors
    ///
    /// Whatever [`WorkflowStore::put`] returns, or a [`TriggerError`] if a
    /// trigger config names an unrecognized or unregistered type.
    pub async fn save_workflow(&self, mut workflow: Workflow) -> Result<Workflow, OrchestratorError> {
        let now = Utc::now();
        let mut normalized = Vec::with_capacity(workflow.triggers.len());
        for cfg in &workflow.triggers {
            normalized.push(self.normalize_trigger_config(cfg, now)?);
        }
        workflow.triggers = normalized;

        let is_create = workflow.id.is_nil();
        let saved = self.inner.workflow_store.put(workflow).await?;

        if is_create {
            let _ = publish_value(
                self.inner.bus.as_ref(),
                topic::WORKFLOW_CREATED,
                &WorkflowCreatedPayload { workflow_id: saved.id },
            );
        }

        self.spawn_listener_refresh();
        Ok(saved)
    }

    fn normalize_trigger_config(
        &self,
        cfg: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Map<String, Value>, OrchestratorError> {
        let type_name = cfg.get("type").and_then(Value::as_str).unwrap_or_default();
        let listener = self.inner.listeners.get(type_name).ok_or_else(|| {
            OrchestratorError::Trigger(TriggerError::UnknownType {
                type_name: type_name.to_string(),
            })
        })?;
        let trigger = listener.construct_trigger(cfg, now)?;
        Ok(trigger.to_map())
    }

    /// Fetches a workflow by id.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WorkflowStore`] if no such workflow exists.
    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, OrchestratorError> {
        Ok(self.inner.workflow_store.get(id).await?)
    }

    /// Fetches the workflow automating a dataset.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WorkflowStore`] if no workflow automates it.
    pub async fn get_workflow_by_init_id(&self, init_id: &InitId) -> Result<Workflow, OrchestratorError> {
        Ok(self.inner.workflow_store.get_by_init_id(init_id).await?)
    }

    /// Lists deployed workflows.
    pub async fn list_workflows(&self, offset: usize, limit: usize, only_active: Option<bool>) -> Vec<Workflow> {
        self.inner.workflow_store.list(offset, limit, only_active).await
    }

    /// Removes a workflow: clears its triggers and marks it inactive before
    /// deleting it, so an in-flight listener refresh racing the removal sees
    /// an inert record rather than a half-deleted one, then refreshes listeners.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WorkflowStore`] if no such workflow exists.
    pub async fn remove_workflow(&self, id: WorkflowId) -> Result<(), OrchestratorError> {
        if let Ok(mut workflow) = self.inner.workflow_store.get(id).await {
            workflow.active = false;
            workflow.triggers.clear();
            let _ = self.inner.workflow_store.put(workflow).await;
        }
        self.inner.workflow_store.remove(id).await?;
        let _ = publish_value(
            self.inner.bus.as_ref(),
            topic::WORKFLOW_REMOVED,
            &WorkflowRemovedPayload { workflow_id: id },
        );
        self.spawn_listener_refresh();
        Ok(())
    }

    /// Enqueues a run of `workflow_id`'s transform.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WorkflowStore`] if no such workflow exists.
    pub async fn run_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowRunId, OrchestratorError> {
        self.enqueue(workflow_id, crate::events::RunMode::Run, self.inner.run_fn.clone()).await
    }

    /// Enqueues an apply (dry-run transform, no save) of `workflow_id`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WorkflowStore`] if no such workflow exists.
    pub async fn apply_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowRunId, OrchestratorError> {
        self.enqueue(workflow_id, crate::events::RunMode::Apply, self.inner.apply_fn.clone()).await
    }

    async fn enqueue(
        &self,
        workflow_id: WorkflowId,
        mode: crate::events::RunMode,
        run_fn: RunFn,
    ) -> Result<WorkflowRunId, OrchestratorError> {
        let workflow = self.inner.workflow_store.get(workflow_id).await?;
        let run_id = WorkflowRunId::new();
        let inner = self.inner.clone();
        let workflow_for_task = workflow.clone();

        self.inner.queue.push(
            workflow.owner_id.clone(),
            workflow.init_id.clone(),
            run_id,
            mode,
            Box::new(move |token: CancelToken| -> BoxFuture<'static, ()> {
                Box::pin(async move { execute_run(inner, workflow_for_task, run_id, mode, token, run_fn).await })
            }) as QueueTask,
        );
        Ok(run_id)
    }

    /// Cancels a queued or in-flight run.
    pub fn cancel_run(&self, run_id: WorkflowRunId) {
        self.inner.queue.cancel(run_id);
        let _ = publish_id_value(
            self.inner.bus.as_ref(),
            topic::WORKFLOW_CANCELED,
            &run_id.to_string(),
            &crate::events::WorkflowCanceledPayload { run_id },
        );
    }

    /// Starts the orchestrator: subscribes to `automation:WorkflowTrigger`,
    /// starts every registered listener, and performs an initial refresh of
    /// their trigger sets from the currently deployed workflows.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyStopped`] if [`Orchestrator::stop`] has already been called.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let this = self.clone();
        self.inner.bus.subscribe_topics(
            &[topic::WORKFLOW_TRIGGER],
            Box::new(move |event| {
                let this = this.clone();
                let payload = event.payload.clone();
                tokio::spawn(async move {
                    if let Ok(trigger) = serde_json::from_value::<WorkflowTriggerPayload>(payload) {
                        this.handle_trigger(trigger).await;
                    }
                });
                Ok(())
            }),
        );

        for listener in self.inner.listeners.values() {
            listener.start();
        }
        self.refresh_listeners().await;
        info!(listeners = self.inner.listeners.len(), "orchestrator started");
        Ok(())
    }

    async fn handle_trigger(&self, trigger: WorkflowTriggerPayload) {
        debug!(workflow_id = %trigger.workflow_id, trigger_id = %trigger.trigger_id, "handling workflow trigger");
        if let Err(err) = self.advance_fired_trigger(&trigger).await {
            warn!(%err, workflow_id = %trigger.workflow_id, "failed to advance fired trigger");
        }
        if let Err(err) = self.run_workflow(trigger.workflow_id).await {
            warn!(%err, workflow_id = %trigger.workflow_id, "failed to enqueue triggered run");
        }
    }

    /// Fetches the fired trigger's workflow, advances the matching trigger
    /// (by id) so its internal state moves forward (e.g. a cron trigger's
    /// `nextRunStart`), and persists the updated config.
    async fn advance_fired_trigger(&self, fired: &WorkflowTriggerPayload) -> Result<(), OrchestratorError> {
        let mut workflow = self.inner.workflow_store.get(fired.workflow_id).await?;
        let now = Utc::now();
        let trigger_id = fired.trigger_id.to_string();
        let mut advanced = false;

        for cfg in &mut workflow.triggers {
            if cfg.get("id").and_then(Value::as_str) != Some(trigger_id.as_str()) {
                continue;
            }
            let mut trigger = self.inner.trigger_registry.construct(cfg, now)?;
            trigger.advance(now);
            *cfg = trigger.to_map();
            advanced = true;
            break;
        }

        if advanced {
            self.inner.workflow_store.put(workflow).await?;
        }
        Ok(())
    }

    fn spawn_listener_refresh(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.refresh_listeners().await;
        });
    }

    /// Rebuilds every listener's active trigger set from the currently
    /// deployed workflows. Exposed for tests that need to observe a refresh
    /// has completed rather than racing the background task spawned by
    /// [`Orchestrator::save_workflow`]/[`Orchestrator::remove_workflow`]/[`Orchestrator::start`].
    pub async fn refresh_listeners(&self) {
        let _guard = self.inner.refresh_lock.lock().await;
        let workflows = self.inner.workflow_store.list(0, usize::MAX, None).await;

        for (kind, listener) in &self.inner.listeners {
            let mut sources = Vec::new();
            for workflow in &workflows {
                let triggers: Vec<Box<dyn flowcore_triggers::Trigger>> = workflow
                    .triggers
                    .iter()
                    .filter(|cfg| cfg.get("type").and_then(Value::as_str) == Some(*kind))
                    .filter_map(|cfg| self.inner.trigger_registry.construct(cfg, Utc::now()).ok())
                    .collect();
                sources.push(TriggerSource {
                    owner_id: workflow.owner_id.clone(),
                    workflow_id: workflow.id,
                    workflow_active: workflow.active,
                    triggers,
                });
            }
            listener.listen(&sources);
        }
    }

    /// Stops accepting new triggers and runs: stops every listener and closes
    /// the run queue to new pushes. In-flight runs are not cancelled.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for listener in self.inner.listeners.values() {
            listener.stop();
        }
        self.inner.queue.shutdown();
        info!("orchestrator stopped");
    }

    /// Stops the orchestrator and releases the workflow/run stores' resources.
    pub async fn shutdown(&self) {
        self.stop();
        self.inner.workflow_store.shutdown().await;
        self.inner.bus.close();
    }
}

async fn execute_run(
    inner: Arc<Inner>,
    workflow: Workflow,
    run_id: WorkflowRunId,
    mode: crate::events::RunMode,
    token: CancelToken,
    run_fn: RunFn,
) {
    let _ = publish_value(
        inner.bus.as_ref(),
        topic::WORKFLOW_STARTED,
        &WorkflowStartedPayload {
            init_id: workflow.init_id.clone(),
            owner_id: workflow.owner_id.clone(),
            workflow_id: workflow.id,
            run_id,
        },
    );

    // Apply runs are previews: they execute the same event sequence but
    // never materialize a run-store record.
    if mode == crate::events::RunMode::Run {
        if let Some(run_store) = &inner.run_store {
            let _ = run_store.create(RunState::new(run_id, workflow.id)).await;
            let run_store = run_store.clone();
            let run_id_str = run_id.to_string();
            inner.bus.subscribe_id(
                &run_id_str,
                Box::new(move |event| {
                    if let Some(run_event) = run_event_from_bus_event(event) {
                        let run_store = run_store.clone();
                        tokio::spawn(async move {
                            let _ = run_store.add_event(run_id, run_event).await;
                        });
                    }
                    Ok(())
                }),
            );
        }
    }

    let outcome = tokio::select! {
        outcome = run_fn(workflow.clone(), run_id, token.clone()) => outcome,
        () = token.canceled() => {
            // The run future is dropped here without finishing, so it never
            // gets to publish its own transform:Stop. Publish the terminal
            // pair directly on the bus so late subscribers (the run-state
            // fold included) still observe why and that the run ended.
            let _ = publish_id_value(
                inner.bus.as_ref(),
                topic::TRANSFORM_ERROR,
                &run_id.to_string(),
                &crate::events::TransformErrorPayload {
                    level: crate::events::LogLevel::Error,
                    message: "run canceled".to_string(),
                },
            );
            let _ = publish_id_value(
                inner.bus.as_ref(),
                topic::TRANSFORM_STOP,
                &run_id.to_string(),
                &crate::events::TransformStopPayload {
                    status: crate::events::RunStatus::Failed,
                },
            );
            RunOutcome::Failed
        }
    };
    let status = outcome.into_status();

    let _ = publish_value(
        inner.bus.as_ref(),
        topic::WORKFLOW_STOPPED,
        &WorkflowStoppedPayload {
            init_id: workflow.init_id,
            owner_id: workflow.owner_id,
            workflow_id: workflow.id,
            run_id,
            status,
        },
    );
}

/// Translates a raw bus event into the [`RunEvent`] the run store folds, if
/// the event's topic is one of the `transform:*` vocabulary and its payload
/// parses. Events on any other topic, or with a malformed payload, fold to
/// nothing — the run-store subscription only cares about this one family.
fn run_event_from_bus_event(event: &crate::events::Event) -> Option<RunEvent> {
    use crate::events::{
        TransformDatasetPreviewPayload, TransformErrorPayload, TransformPrintPayload, TransformStartPayload,
        TransformStepSkipPayload, TransformStepStartPayload, TransformStepStopPayload, TransformStopPayload,
    };

    match event.topic.as_str() {
        t if t == topic::TRANSFORM_START => {
            let payload: TransformStartPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::Start {
                step_count: payload.step_count,
            })
        }
        t if t == topic::TRANSFORM_STEP_START => {
            let payload: TransformStepStartPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::StepStart {
                name: payload.name,
                category: payload.category,
            })
        }
        t if t == topic::TRANSFORM_PRINT => {
            let payload: TransformPrintPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::Print {
                level: payload.level,
                message: payload.message,
            })
        }
        t if t == topic::TRANSFORM_ERROR => {
            let payload: TransformErrorPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::Error {
                level: payload.level,
                message: payload.message,
            })
        }
        t if t == topic::TRANSFORM_DATASET_PREVIEW => {
            let payload: TransformDatasetPreviewPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::DatasetPreview { preview: payload.preview })
        }
        t if t == topic::TRANSFORM_STEP_STOP => {
            let payload: TransformStepStopPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::StepStop { status: payload.status })
        }
        t if t == topic::TRANSFORM_STEP_SKIP => {
            let payload: TransformStepSkipPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::StepSkip {
                name: payload.name,
                category: payload.category,
            })
        }
        t if t == topic::TRANSFORM_STOP => {
            let payload: TransformStopPayload = serde_json::from_value(event.payload.clone()).ok()?;
            Some(RunEvent::Stop { status: payload.status })
        }
        _ => None,
    }
}

/// Pushes a [`FiringRequest`] derived from a workflow trigger straight onto a
/// [`flowcore_triggers::RuntimeListener`] — a convenience for callers driving
/// a manual firing (e.g. an API handler) rather than going through the bus's
/// trigger topic.
pub fn push_runtime_firing(
    listener: &flowcore_triggers::RuntimeListener,
    owner_id: OwnerId,
    workflow_id: WorkflowId,
    trigger_id: flowcore_core::TriggerId,
) {
    listener.push(FiringRequest {
        owner_id,
        workflow_id,
        trigger_id,
    });
}
