//! The run queue: a bounded FIFO of pending runs/applies, drained by a small
//! pool of worker tasks, with per-run cooperative cancellation.
//!
//! Pushing registers a [`CancelToken`] for the run before the item is ever
//! popped, so `cancel` works whether the run is still queued or already
//! executing — the queued function observes the same token either way.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use flowcore_core::{InitId, OwnerId, WorkflowRunId};

use crate::bus::EventBus;
use crate::error::QueueError;
use crate::events::{topic, QueuePopPayload, QueuePushPayload, RunMode};

fn pop_topic(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Run => topic::RUN_QUEUE_POP,
        RunMode::Apply => topic::APPLY_QUEUE_POP,
    }
}

/// A cooperative cancellation signal, shared between the pusher (who can
/// cancel) and the pushed function (who observes it).
#[derive(Clone)]
pub struct CancelToken {
    notify: Arc<Notify>,
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the token cancelled and wakes anyone currently awaiting [`CancelToken::canceled`].
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled. Registers as a waiter before
    /// checking the flag so a `cancel()` racing with the first poll is never missed.
    pub async fn canceled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The function a queued item runs, given its own cancellation token.
pub type QueueTask = Box<dyn FnOnce(CancelToken) -> BoxFuture<'static, ()> + Send>;

struct QueueItem {
    owner_id: OwnerId,
    init_id: InitId,
    run_id: WorkflowRunId,
    mode: RunMode,
    task: QueueTask,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("owner_id", &self.owner_id)
            .field("init_id", &self.init_id)
            .field("run_id", &self.run_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// A bounded FIFO of pending runs, drained by a small worker pool.
pub struct RunQueue {
    bus: Arc<dyn EventBus>,
    queue: Arc<Mutex<VecDeque<QueueItem>>>,
    cancellations: Arc<RwLock<HashMap<WorkflowRunId, CancelToken>>>,
    closed: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl RunQueue {
    /// Spawns `worker_count` polling tasks (at least one), each polling every
    /// `poll_interval`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, worker_count: usize, poll_interval: Duration) -> Self {
        let worker_count = worker_count.max(1);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let cancellations = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|_| {
                tokio::spawn(worker_loop(
                    bus.clone(),
                    queue.clone(),
                    cancellations.clone(),
                    closed.clone(),
                    poll_interval,
                ))
            })
            .collect();

        Self {
            bus,
            queue,
            cancellations,
            closed,
            workers,
        }
    }

    /// Enqueues `task` under a fresh cancellation token, publishing a
    /// mode-specific push event regardless of whether the queue is closed.
    /// After shutdown, the push is recorded but the task is never executed.
    pub fn push(&self, owner_id: OwnerId, init_id: InitId, run_id: WorkflowRunId, mode: RunMode, task: QueueTask) {
        let topic_name = match mode {
            RunMode::Run => topic::RUN_QUEUE_PUSH,
            RunMode::Apply => topic::APPLY_QUEUE_PUSH,
        };
        let _ = crate::bus::publish_id_value(
            self.bus.as_ref(),
            topic_name,
            &run_id.to_string(),
            &QueuePushPayload {
                owner_id: owner_id.clone(),
                init_id: init_id.clone(),
                run_id,
                mode,
            },
        );

        if self.closed.load(Ordering::SeqCst) {
            debug!(%run_id, "push recorded but queue closed; task will not run");
            return;
        }

        let token = CancelToken::new();
        self.cancellations.write().expect("queue lock poisoned").insert(run_id, token);
        self.queue.lock().expect("queue lock poisoned").push_back(QueueItem {
            owner_id,
            init_id,
            run_id,
            mode,
            task,
        });
    }

    /// Cancels a run, whether it is still queued or already executing. A
    /// no-op if no token is registered for `run_id` (already completed, or
    /// never pushed).
    pub fn cancel(&self, run_id: WorkflowRunId) {
        if let Some(token) = self.cancellations.read().expect("queue lock poisoned").get(&run_id) {
            token.cancel();
        }
    }

    /// Stops accepting new work. Workers finish their current item (if any)
    /// and then exit; in-flight tasks are not force-cancelled.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Current queue depth, not counting in-flight items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        self.shutdown();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Pops the oldest queued item, if any.
///
/// # Errors
///
/// [`QueueError::Empty`] if the queue currently has nothing waiting.
fn try_pop(queue: &Mutex<VecDeque<QueueItem>>) -> Result<QueueItem, QueueError> {
    queue.lock().expect("queue lock poisoned").pop_front().ok_or(QueueError::Empty)
}

async fn worker_loop(
    bus: Arc<dyn EventBus>,
    queue: Arc<Mutex<VecDeque<QueueItem>>>,
    cancellations: Arc<RwLock<HashMap<WorkflowRunId, CancelToken>>>,
    closed: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    loop {
        let item = try_pop(&queue);
        match item {
            Ok(item) => {
                let token = cancellations
                    .read()
                    .expect("queue lock poisoned")
                    .get(&item.run_id)
                    .cloned()
                    .unwrap_or_default();
                let _ = crate::bus::publish_id_value(
                    bus.as_ref(),
                    pop_topic(item.mode),
                    &item.run_id.to_string(),
                    &QueuePopPayload {
                        run_id: item.run_id,
                        mode: item.mode,
                    },
                );
                (item.task)(token).await;
                cancellations.write().expect("queue lock poisoned").remove(&item.run_id);
            }
            Err(QueueError::Empty) => {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration as TokioDuration};

    fn queue() -> RunQueue {
        RunQueue::new(Arc::new(Bus::new()), 1, TokioDuration::from_millis(5))
    }

    #[tokio::test]
    async fn pushed_task_runs() {
        let queue = queue();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.push(
            OwnerId::new("alice"),
            InitId::new("ds_1"),
            WorkflowRunId::new(),
            RunMode::Run,
            Box::new(move |_token| {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                })
            }),
        );
        sleep(TokioDuration::from_millis(50)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_before_pop_is_observed_by_the_task() {
        let queue = Arc::new(queue());
        let run_id = WorkflowRunId::new();
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        queue.push(
            OwnerId::new("alice"),
            InitId::new("ds_1"),
            run_id,
            RunMode::Run,
            Box::new(move |token| {
                Box::pin(async move {
                    token.canceled().await;
                    flag.store(true, Ordering::SeqCst);
                })
            }),
        );
        queue.cancel(run_id);
        sleep(TokioDuration::from_millis(50)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pop_publishes_a_pop_event() {
        let bus = Arc::new(Bus::new());
        let queue = RunQueue::new(bus.clone(), 1, TokioDuration::from_millis(5));
        let seen = Arc::new(AtomicUsize::new(0));
        let flag = seen.clone();
        bus.subscribe_topics(
            &[topic::RUN_QUEUE_POP],
            Box::new(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        queue.push(
            OwnerId::new("alice"),
            InitId::new("ds_1"),
            WorkflowRunId::new(),
            RunMode::Run,
            Box::new(move |_token| Box::pin(async {})),
        );
        sleep(TokioDuration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_still_records_push_but_skips_execution() {
        let queue = queue();
        queue.shutdown();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        queue.push(
            OwnerId::new("alice"),
            InitId::new("ds_1"),
            WorkflowRunId::new(),
            RunMode::Run,
            Box::new(move |_token| {
                Box::pin(async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        sleep(TokioDuration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn try_pop_on_empty_queue_is_not_found() {
        let queue: Mutex<VecDeque<QueueItem>> = Mutex::new(VecDeque::new());
        let err = try_pop(&queue).unwrap_err();
        assert_eq!(err, QueueError::Empty);
        assert_eq!(err.kind(), flowcore_core::ErrorKind::NotFound);
    }

    #[test]
    fn cancel_token_canceled_resolves_after_cancel() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let token = CancelToken::new();
            let waiter = token.clone();
            let handle = tokio::spawn(async move {
                waiter.canceled().await;
            });
            sleep(TokioDuration::from_millis(10)).await;
            token.cancel();
            handle.await.unwrap();
        });
    }
}
