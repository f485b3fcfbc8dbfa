//! Listeners: the actors that turn external stimuli into workflow-trigger
//! events for one trigger kind.
//!
//! A listener never publishes directly onto a concrete event bus type — doing
//! so would make this crate depend on the automation crate that depends on
//! it. Instead it publishes through the small [`TriggerEventPublisher`] seam,
//! the same trait-at-the-boundary idiom used elsewhere in this codebase for
//! swappable backends (an event-store trait with an in-memory test double and
//! a production implementation).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use flowcore_core::{OwnerId, TriggerId, WorkflowId};

use crate::error::{ListenerError, TriggerError};
use crate::set::{TriggerSet, TriggerSource};
use crate::trigger::{CRON_TRIGGER_TYPE, CronTrigger, ManualTrigger, RUNTIME_TRIGGER_TYPE, Trigger};

/// Publishes a workflow-trigger event. Implemented by the automation crate's
/// event bus adapter; a no-op implementation is useful for tests that only
/// exercise listener bookkeeping.
pub trait TriggerEventPublisher: Send + Sync {
    /// Publishes that `trigger_id` (on `workflow_id`, owned by `owner_id`) fired.
    fn publish_workflow_trigger(
        &self,
        owner_id: &OwnerId,
        workflow_id: &WorkflowId,
        trigger_id: TriggerId,
    ) -> Result<(), ListenerError>;
}

/// A listener with a single trigger kind.
pub trait Listener: Send + Sync {
    /// The trigger type this listener handles.
    fn kind(&self) -> &'static str;

    /// Parses and validates a configuration map, failing with a type
    /// mismatch if `cfg["type"]` differs from [`Listener::kind`].
    fn construct_trigger(&self, cfg: &Map<String, Value>, now: DateTime<Utc>) -> Result<Box<dyn Trigger>, TriggerError>;

    /// Replaces this listener's trigger-set bucket for each referenced workflow.
    fn listen(&self, sources: &[TriggerSource]);

    /// Enters the actively-firing state.
    fn start(&self);

    /// Leaves the actively-firing state. Firings received afterward are dropped.
    fn stop(&self);

    /// True while started.
    fn is_started(&self) -> bool;
}

/// A firing request pushed onto the runtime listener's channel.
#[derive(Debug, Clone)]
pub struct FiringRequest {
    /// The owner of the workflow to fire.
    pub owner_id: OwnerId,
    /// The workflow to fire.
    pub workflow_id: WorkflowId,
    /// The specific trigger being fired.
    pub trigger_id: TriggerId,
}

struct RuntimeInner {
    set: TriggerSet,
    started: AtomicBool,
    publisher: Arc<dyn TriggerEventPublisher>,
}

/// Fires on external demand: code elsewhere pushes [`FiringRequest`]s onto a
/// channel; each is checked against the active set and, if matched and the
/// listener is started, published. Everything else is dropped, not buffered.
pub struct RuntimeListener {
    inner: Arc<RuntimeInner>,
    sender: mpsc::UnboundedSender<FiringRequest>,
    _task: JoinHandle<()>,
}

impl RuntimeListener {
    /// Spawns the listener's background dispatch task. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn new(publisher: Arc<dyn TriggerEventPublisher>) -> Self {
        let inner = Arc::new(RuntimeInner {
            set: TriggerSet::new(),
            started: AtomicBool::new(false),
            publisher,
        });
        let (sender, mut receiver) = mpsc::unbounded_channel::<FiringRequest>();
        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                if !task_inner.started.load(Ordering::SeqCst) {
                    trace!(workflow_id = %request.workflow_id, "runtime firing dropped: listener stopped");
                    continue;
                }
                let matches = task_inner
                    .set
                    .active()
                    .get(&request.owner_id)
                    .and_then(|bucket| bucket.get(&request.workflow_id))
                    .is_some_and(|triggers| triggers.iter().any(|t| t.id() == request.trigger_id));
                if !matches {
                    trace!(workflow_id = %request.workflow_id, "runtime firing dropped: no matching active trigger");
                    continue;
                }
                if let Err(err) = task_inner.publisher.publish_workflow_trigger(
                    &request.owner_id,
                    &request.workflow_id,
                    request.trigger_id,
                ) {
                    warn!(%err, "failed to publish workflow-trigger event");
                }
            }
        });
        Self {
            inner,
            sender,
            _task: task,
        }
    }

    /// Pushes a firing request onto the channel.
    pub fn push(&self, request: FiringRequest) {
        let _ = self.sender.send(request);
    }
}

impl Listener for RuntimeListener {
    fn kind(&self) -> &'static str {
        RUNTIME_TRIGGER_TYPE
    }

    fn construct_trigger(&self, cfg: &Map<String, Value>, _now: DateTime<Utc>) -> Result<Box<dyn Trigger>, TriggerError> {
        let found = cfg.get("type").and_then(Value::as_str).unwrap_or_default();
        if found != RUNTIME_TRIGGER_TYPE {
            return Err(TriggerError::TypeMismatch {
                expected: RUNTIME_TRIGGER_TYPE.to_string(),
                found: found.to_string(),
            });
        }
        ManualTrigger::construct(cfg)
    }

    fn listen(&self, sources: &[TriggerSource]) {
        debug!(count = sources.len(), "runtime listener refreshing trigger set");
        self.inner.set.add(sources.iter());
    }

    fn start(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }
}

struct CronInner {
    set: TriggerSet,
    started: AtomicBool,
    publisher: Arc<dyn TriggerEventPublisher>,
    now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

/// Ticks on an injectable period, firing every trigger in its active set
/// whose `nextRunStart` is strictly before the injectable `now()`.
///
/// Firings within a single tick are published in the active set's iteration
/// order, which (like the source's map ranges) is not itself deterministic
/// across runs; no ordering guarantee beyond "per tick, not interleaved
/// across ticks" is made or required.
pub struct CronListener {
    inner: Arc<CronInner>,
    _task: JoinHandle<()>,
}

impl CronListener {
    /// Spawns the listener's ticking task. `now` is injectable so tests can
    /// use a fixed instant; `period` is injectable so tests can use an
    /// accelerated interval (e.g. 100ms instead of the 1s production default).
    #[must_use]
    pub fn new(
        publisher: Arc<dyn TriggerEventPublisher>,
        period: Duration,
        now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        let inner = Arc::new(CronInner {
            set: TriggerSet::new(),
            started: AtomicBool::new(false),
            publisher,
            now,
        });
        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !task_inner.started.load(Ordering::SeqCst) {
                    continue;
                }
                let now = (task_inner.now)();
                for (owner_id, workflow_id, trigger_id) in task_inner.set.advance_due(now) {
                    if let Err(err) =
                        task_inner.publisher.publish_workflow_trigger(&owner_id, &workflow_id, trigger_id)
                    {
                        warn!(%err, "failed to publish workflow-trigger event");
                    }
                }
            }
        });
        Self { inner, _task: task }
    }

    /// The default tick period (one second).
    #[must_use]
    pub fn default_period() -> Duration {
        Duration::from_secs(1)
    }
}

impl Listener for CronListener {
    fn kind(&self) -> &'static str {
        CRON_TRIGGER_TYPE
    }

    fn construct_trigger(&self, cfg: &Map<String, Value>, now: DateTime<Utc>) -> Result<Box<dyn Trigger>, TriggerError> {
        let found = cfg.get("type").and_then(Value::as_str).unwrap_or_default();
        if found != CRON_TRIGGER_TYPE {
            return Err(TriggerError::TypeMismatch {
                expected: CRON_TRIGGER_TYPE.to_string(),
                found: found.to_string(),
            });
        }
        CronTrigger::construct(cfg, now)
    }

    fn listen(&self, sources: &[TriggerSource]) {
        debug!(count = sources.len(), "cron listener refreshing trigger set");
        self.inner.set.add(sources.iter());
    }

    fn start(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::ManualTrigger;
    use std::sync::Mutex;
    use tokio::time::{Duration as TokioDuration, sleep};

    #[derive(Default)]
    struct RecordingPublisher {
        fired: Mutex<Vec<(OwnerId, WorkflowId, TriggerId)>>,
    }

    impl TriggerEventPublisher for RecordingPublisher {
        fn publish_workflow_trigger(
            &self,
            owner_id: &OwnerId,
            workflow_id: &WorkflowId,
            trigger_id: TriggerId,
        ) -> Result<(), ListenerError> {
            self.fired
                .lock()
                .unwrap()
                .push((owner_id.clone(), workflow_id.clone(), trigger_id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn runtime_listener_drops_firings_before_start() {
        let publisher = Arc::new(RecordingPublisher::default());
        let listener = RuntimeListener::new(publisher.clone());

        let mut trigger = ManualTrigger::new();
        trigger.set_active(true);
        let trigger_id = trigger.id();
        let owner_id = OwnerId::new("owner");
        let workflow_id = WorkflowId::new();
        listener.listen(&[TriggerSource {
            owner_id: owner_id.clone(),
            workflow_id: workflow_id.clone(),
            workflow_active: true,
            triggers: vec![Box::new(trigger)],
        }]);

        listener.push(FiringRequest {
            owner_id,
            workflow_id,
            trigger_id,
        });
        sleep(TokioDuration::from_millis(20)).await;
        assert!(publisher.fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn runtime_listener_fires_matching_trigger_after_start() {
        let publisher = Arc::new(RecordingPublisher::default());
        let listener = RuntimeListener::new(publisher.clone());

        let mut trigger = ManualTrigger::new();
        trigger.set_active(true);
        let trigger_id = trigger.id();
        let owner_id = OwnerId::new("owner");
        let workflow_id = WorkflowId::new();
        listener.listen(&[TriggerSource {
            owner_id: owner_id.clone(),
            workflow_id: workflow_id.clone(),
            workflow_active: true,
            triggers: vec![Box::new(trigger)],
        }]);
        listener.start();

        listener.push(FiringRequest {
            owner_id,
            workflow_id,
            trigger_id,
        });
        sleep(TokioDuration::from_millis(20)).await;
        assert_eq!(publisher.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runtime_listener_drops_after_stop() {
        let publisher = Arc::new(RecordingPublisher::default());
        let listener = RuntimeListener::new(publisher.clone());

        let mut trigger = ManualTrigger::new();
        trigger.set_active(true);
        let trigger_id = trigger.id();
        let owner_id = OwnerId::new("owner");
        let workflow_id = WorkflowId::new();
        listener.listen(&[TriggerSource {
            owner_id: owner_id.clone(),
            workflow_id: workflow_id.clone(),
            workflow_active: true,
            triggers: vec![Box::new(trigger)],
        }]);
        listener.start();
        listener.stop();

        listener.push(FiringRequest {
            owner_id,
            workflow_id,
            trigger_id,
        });
        sleep(TokioDuration::from_millis(20)).await;
        assert!(publisher.fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cron_listener_fires_due_trigger_on_tick() {
        let publisher = Arc::new(RecordingPublisher::default());
        let fixed_now = Arc::new(|| Utc::now());
        let listener = CronListener::new(publisher.clone(), TokioDuration::from_millis(10), fixed_now);

        let owner_id = OwnerId::new("owner");
        let workflow_id = WorkflowId::new();
        let periodicity = crate::schedule::Periodicity::parse("R/PT1H").unwrap();
        // seed nextRunStart in the past so the first tick finds it due.
        let mut trigger = CronTrigger::new(periodicity, Utc::now() - chrono::Duration::hours(2));
        trigger.set_active(true);
        listener.listen(&[TriggerSource {
            owner_id,
            workflow_id,
            workflow_active: true,
            triggers: vec![Box::new(trigger)],
        }]);
        listener.start();

        sleep(TokioDuration::from_millis(50)).await;
        assert_eq!(publisher.fired.lock().unwrap().len(), 1);
    }
}
