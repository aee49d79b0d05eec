//! Task submission, durable queueing, dispatch and live output fan-out.

mod streams;

pub use streams::{TaskStreamEvent, TaskStreams};

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wing_proto::{RelayMessage, TaskSpec};

use crate::{
    connection::SendError,
    metrics,
    registry::{ConnectedWing, WingRegistry},
    store::{self, AuditEntry, RelayStore, StoreError, Task, TaskOutcome, TaskStatus},
};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("send to wing failed: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub enum TaskSubscription {
    Live(mpsc::Receiver<TaskStreamEvent>),
    Finished(TaskStreamEvent),
}

#[derive(Clone)]
pub struct TaskPipeline {
    store: Arc<dyn RelayStore>,
    registry: WingRegistry,
    streams: Arc<TaskStreams>,
    dispatch_timeout: Duration,
    // Serializes dispatch per user so a drain and a submit never hand the
    // same pending task to two wings.
    user_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TaskPipeline {
    pub fn new(
        store: Arc<dyn RelayStore>,
        registry: WingRegistry,
        dispatch_timeout: Duration,
        stream_buffer: usize,
    ) -> Self {
        Self {
            store,
            registry,
            streams: Arc::new(TaskStreams::new(stream_buffer)),
            dispatch_timeout,
            user_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn streams(&self) -> &TaskStreams {
        &self.streams
    }

    /// Explicit identity among the user's wings first, then any wing the user owns.
    pub fn resolve_target(&self, user_id: &str, target: Option<&str>) -> Option<Arc<ConnectedWing>> {
        let owned = self.registry.list_for_user(user_id);
        if let Some(identity) = target {
            if let Some(wing) = owned
                .iter()
                .filter(|wing| wing.answers_to(identity))
                .max_by_key(|wing| wing.last_seen_ms())
            {
                return Some(Arc::clone(wing));
            }
        }
        owned.into_iter().max_by_key(|wing| wing.last_seen_ms())
    }

    pub async fn submit(
        &self,
        user_id: &str,
        target: Option<String>,
        spec: TaskSpec,
    ) -> Result<Task, StoreError> {
        let wing = self.resolve_target(user_id, target.as_deref());
        let task = Task::new(user_id, target, spec);
        self.store.insert_task(&task).await?;
        metrics::TASK_TRANSITIONS
            .with_label_values(&[TaskStatus::Pending.as_str()])
            .inc();

        let Some(wing) = wing else {
            info!(task_id = %task.id, user_id, "no wing online; task queued");
            return Ok(task);
        };

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        // A drain that held the lock first may already have taken it.
        let still_pending = self
            .store
            .get_task(&task.id)
            .await?
            .is_some_and(|current| current.status == TaskStatus::Pending);
        if !still_pending {
            return Ok(self.store.get_task(&task.id).await?.unwrap_or(task));
        }
        if let Err(err) = self.dispatch(&task, &wing).await {
            metrics::DISPATCH_FAILURES.inc();
            warn!(task_id = %task.id, wing_id = %wing.wing_id, error = %err, "dispatch failed; task left pending");
        }
        Ok(self.store.get_task(&task.id).await?.unwrap_or(task))
    }

    /// Sends the task to `wing` and marks it running once the frame is on the
    /// wire. A frame that is never written leaves the task pending for the next
    /// drain.
    pub async fn dispatch(&self, task: &Task, wing: &ConnectedWing) -> Result<bool, DispatchError> {
        wing.handle
            .deliver(
                RelayMessage::SubmitTask {
                    task_id: task.id.clone(),
                    spec: task.spec.clone(),
                },
                self.dispatch_timeout,
            )
            .await?;
        let started = self.store.mark_running(&task.id, &wing.wing_id).await?;
        if started {
            metrics::TASK_TRANSITIONS
                .with_label_values(&[TaskStatus::Running.as_str()])
                .inc();
            store::audit(
                self.store.as_ref(),
                AuditEntry::new(
                    &task.user_id,
                    Some(&wing.wing_id),
                    "task.dispatch",
                    json!({ "task_id": task.id }),
                ),
            )
            .await;
        }
        Ok(started)
    }

    /// Hands every pending task of the wing's user to the newly connected wing,
    /// oldest first. Stops at the first send failure so later tasks stay queued
    /// in order.
    pub async fn drain_pending(&self, wing: &ConnectedWing) -> usize {
        let lock = self.user_lock(&wing.user_id);
        let _guard = lock.lock().await;
        let pending = match self.store.pending_tasks_for_user(&wing.user_id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(user_id = %wing.user_id, error = %err, "failed to load pending tasks");
                return 0;
            }
        };
        let mut dispatched = 0;
        for task in pending {
            match self.dispatch(&task, wing).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(err) => {
                    metrics::DISPATCH_FAILURES.inc();
                    warn!(task_id = %task.id, wing_id = %wing.wing_id, error = %err, "drain stopped");
                    break;
                }
            }
        }
        if dispatched > 0 {
            info!(wing_id = %wing.wing_id, dispatched, "pending tasks drained");
        }
        dispatched
    }

    pub fn output(&self, task_id: &str, chunk: String) {
        self.streams
            .publish(task_id, TaskStreamEvent::Output { chunk });
    }

    /// Persists the terminal result, then closes the task's streams. A repeated
    /// terminal message finds the task already finished and changes nothing.
    pub async fn complete(&self, wing: &ConnectedWing, task_id: &str, outcome: TaskOutcome) -> bool {
        match self.store.get_task(task_id).await {
            Ok(Some(task)) if task.user_id == wing.user_id => {}
            Ok(_) => {
                debug!(task_id, wing_id = %wing.wing_id, "ignoring result for unknown task");
                return false;
            }
            Err(err) => {
                warn!(task_id, error = %err, "task lookup failed");
                return false;
            }
        }

        let transitioned = match self.store.complete_task(task_id, &outcome).await {
            Ok(transitioned) => transitioned,
            Err(err) => {
                warn!(task_id, error = %err, "failed to persist task result");
                return false;
            }
        };
        if !transitioned {
            debug!(task_id, "duplicate terminal message ignored");
            return false;
        }

        let (status, event) = match outcome {
            TaskOutcome::Done { output } => (TaskStatus::Done, TaskStreamEvent::Done { output }),
            TaskOutcome::Failed { error } => (TaskStatus::Failed, TaskStreamEvent::Error { error }),
        };
        metrics::TASK_TRANSITIONS
            .with_label_values(&[status.as_str()])
            .inc();
        self.streams.finish(task_id, event);
        true
    }

    /// Registers a live stream before reading the task, so a completion landing
    /// in between is seen by one path or the other.
    pub async fn subscribe(&self, task: &Task) -> Result<TaskSubscription, StoreError> {
        let rx = self.streams.subscribe(&task.id);
        let current = self.store.get_task(&task.id).await?;
        match current.as_ref().and_then(terminal_event) {
            Some(event) => {
                drop(rx);
                self.streams.prune(&task.id);
                Ok(TaskSubscription::Finished(event))
            }
            None => Ok(TaskSubscription::Live(rx)),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }
}

pub fn terminal_event(task: &Task) -> Option<TaskStreamEvent> {
    match task.status {
        TaskStatus::Done => Some(TaskStreamEvent::Done {
            output: task.output.clone().unwrap_or_default(),
        }),
        TaskStatus::Failed => Some(TaskStreamEvent::Error {
            error: task.error.clone().unwrap_or_default(),
        }),
        TaskStatus::Pending | TaskStatus::Running => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbound, WingHandle};
    use crate::store::MemoryStore;
    use wing_proto::{Capabilities, RegisterPayload};

    fn pipeline(store: Arc<MemoryStore>, registry: &WingRegistry) -> TaskPipeline {
        TaskPipeline::new(store, registry.clone(), Duration::from_millis(200), 8)
    }

    fn connect(
        registry: &WingRegistry,
        wing_id: &str,
        user: &str,
    ) -> (Arc<ConnectedWing>, mpsc::UnboundedReceiver<RelayMessage>) {
        let (wing, outbound) = connect_stalled(registry, wing_id, user);
        (wing, writer(outbound))
    }

    /// A connection whose writer never drains its queue.
    fn connect_stalled(
        registry: &WingRegistry,
        wing_id: &str,
        user: &str,
    ) -> (Arc<ConnectedWing>, mpsc::Receiver<Outbound>) {
        let (handle, rx) = WingHandle::channel();
        let register = RegisterPayload {
            wing_id: wing_id.into(),
            org: None,
            capabilities: Capabilities::default(),
            projects: vec![],
            public_key: None,
            locked: false,
            allowed_peers: 0,
        };
        let wing = registry.add(ConnectedWing::new(
            registry.next_connection_id(),
            user,
            None,
            &register,
            handle,
        ));
        (wing, rx)
    }

    /// Stands in for the socket writer: acknowledges every frame and hands it on.
    fn writer(mut outbound: mpsc::Receiver<Outbound>) -> mpsc::UnboundedReceiver<RelayMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let message = match frame {
                    Outbound::Message(message) => message,
                    Outbound::Tracked(message, ack) => {
                        let _ = ack.send(());
                        message
                    }
                    Outbound::Close(_) => break,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn spec(prompt: &str) -> TaskSpec {
        TaskSpec {
            prompt: prompt.into(),
            ..TaskSpec::default()
        }
    }

    fn submitted_id(frame: Option<RelayMessage>) -> String {
        match frame {
            Some(RelayMessage::SubmitTask { task_id, .. }) => task_id,
            other => panic!("expected submit_task, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn queued_tasks_drain_in_creation_order() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);

        let mut ids = Vec::new();
        for prompt in ["one", "two", "three"] {
            let task = pipeline.submit("u", None, spec(prompt)).await.unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            ids.push(task.id);
        }

        let (wing, mut rx) = connect(&registry, "w-1", "u");
        assert_eq!(pipeline.drain_pending(&wing).await, 3);
        for id in &ids {
            assert_eq!(&submitted_id(rx.recv().await), id);
            let stored = store.get_task(id).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Running);
            assert_eq!(stored.wing_id.as_deref(), Some("w-1"));
        }
        assert_eq!(pipeline.drain_pending(&wing).await, 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn explicit_target_wins_over_other_wings() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);
        let (_a, mut rx_a) = connect(&registry, "desk", "u");
        let (_b, mut rx_b) = connect(&registry, "laptop", "u");
        let (_c, _rx_c) = connect(&registry, "laptop", "someone-else");

        let task = pipeline
            .submit("u", Some("desk".into()), spec("build"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.wing_id.as_deref(), Some("desk"));
        assert_eq!(submitted_id(rx_a.recv().await), task.id);
        assert!(rx_b.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_dispatch_leaves_task_pending() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);
        let (_wing, rx) = connect_stalled(&registry, "w-1", "u");
        drop(rx);

        let task = pipeline.submit("u", None, spec("x")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.wing_id.is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unwritten_dispatch_is_redelivered_to_next_wing() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);
        let (first, stalled) = connect_stalled(&registry, "w-1", "u");

        let task = pipeline.submit("u", None, spec("x")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.wing_id.is_none());

        drop(stalled);
        registry.remove(first.connection_id);
        let (second, mut rx) = connect(&registry, "w-2", "u");
        assert_eq!(pipeline.drain_pending(&second).await, 1);
        assert_eq!(submitted_id(rx.recv().await), task.id);
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.wing_id.as_deref(), Some("w-2"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn completion_persists_then_closes_streams_once() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);
        let (wing, _rx) = connect(&registry, "w-1", "u");
        let task = pipeline.submit("u", None, spec("x")).await.unwrap();

        let TaskSubscription::Live(mut live) = pipeline.subscribe(&task).await.unwrap() else {
            panic!("running task should stream live");
        };
        pipeline.output(&task.id, "partial".into());
        assert!(
            pipeline
                .complete(&wing, &task.id, TaskOutcome::Done { output: "ok".into() })
                .await
        );
        assert!(
            !pipeline
                .complete(&wing, &task.id, TaskOutcome::Failed { error: "dup".into() })
                .await
        );

        assert_eq!(live.recv().await, Some(TaskStreamEvent::Output { chunk: "partial".into() }));
        assert_eq!(live.recv().await, Some(TaskStreamEvent::Done { output: "ok".into() }));
        assert_eq!(live.recv().await, None);

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.output.as_deref(), Some("ok"));
        assert!(stored.finished_at.is_some());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn late_subscriber_gets_persisted_result() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);
        let (wing, _rx) = connect(&registry, "w-1", "u");
        let task = pipeline.submit("u", None, spec("x")).await.unwrap();
        pipeline
            .complete(&wing, &task.id, TaskOutcome::Failed { error: "nope".into() })
            .await;

        match pipeline.subscribe(&task).await.unwrap() {
            TaskSubscription::Finished(event) => {
                assert_eq!(event, TaskStreamEvent::Error { error: "nope".into() })
            }
            TaskSubscription::Live(_) => panic!("finished task must not stream live"),
        }
        assert_eq!(pipeline.streams().subscriber_count(&task.id), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn results_from_foreign_wings_are_ignored() {
        let store = Arc::new(MemoryStore::default());
        let registry = WingRegistry::new(8);
        let pipeline = pipeline(store.clone(), &registry);
        let task = pipeline.submit("u", None, spec("x")).await.unwrap();
        let (intruder, _rx) = connect(&registry, "w-x", "mallory");
        assert!(
            !pipeline
                .complete(&intruder, &task.id, TaskOutcome::Done { output: "forged".into() })
                .await
        );
        assert_eq!(
            store.get_task(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }
}
