use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskStreamEvent {
    Output { chunk: String },
    Done { output: String },
    Error { error: String },
}

impl TaskStreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStreamEvent::Output { .. } => "output",
            TaskStreamEvent::Done { .. } => "done",
            TaskStreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStreamEvent::Output { .. })
    }
}

/// Live output subscribers keyed by task id.
pub struct TaskStreams {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<TaskStreamEvent>>>>,
    buffer: usize,
}

impl TaskStreams {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, task_id: &str) -> mpsc::Receiver<TaskStreamEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Output chunks are best-effort; a lagging subscriber loses chunks.
    pub fn publish(&self, task_id: &str, event: TaskStreamEvent) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(task_id) {
            list.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if list.is_empty() {
                subscribers.remove(task_id);
            }
        }
    }

    /// Removes the fan-out entry and hands `event` to each subscriber before
    /// dropping its sender, which ends the stream. Returns how many streams
    /// were closed; a second call for the same task closes none.
    pub fn finish(&self, task_id: &str, event: TaskStreamEvent) -> usize {
        let Some(list) = self.subscribers.lock().remove(task_id) else {
            return 0;
        };
        let closed = list.len();
        for tx in list {
            // A full buffer would otherwise swallow the terminal event.
            match tx.try_send(event.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tokio::spawn(async move {
                        let _ = tx.send(event).await;
                    });
                }
            }
        }
        closed
    }

    /// Drops senders whose receivers are gone.
    pub fn prune(&self, task_id: &str) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(task_id) {
            list.retain(|tx| !tx.is_closed());
            if list.is_empty() {
                subscribers.remove(task_id);
            }
        }
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
