//! Request/response correlation over a multiplexed wing connection.
//!
//! The relay sends a command carrying a fresh `request_id`, parks a oneshot
//! sender under that id, and the wing's read loop later resolves it when the
//! matching `*_result` frame arrives.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use wing_proto::{DirEntry, SessionInfo};

use crate::metrics;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("request {0} is already in flight")]
    Duplicate(String),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("reply receptacle was dropped")]
    Closed,
}

/// Keyed table of single-use reply slots.
pub struct PendingLedger<T> {
    name: &'static str,
    slots: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> PendingLedger<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Must be called before the outbound command is written.
    pub fn register(&self, request_id: &str) -> Result<oneshot::Receiver<T>, PendingError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(request_id) {
            return Err(PendingError::Duplicate(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(request_id.to_string(), tx);
        Ok(rx)
    }

    /// Delivers `value` to the waiter, if any. Never blocks; returns whether a
    /// live waiter received it.
    pub fn resolve(&self, request_id: &str, value: T) -> bool {
        let slot = self.slots.lock().remove(request_id);
        let delivered = match slot {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        };
        if !delivered {
            metrics::CORRELATION_MISSES
                .with_label_values(&[self.name])
                .inc();
            debug!(table = self.name, request_id, "dropping unmatched reply");
        }
        delivered
    }

    pub fn unregister(&self, request_id: &str) {
        self.slots.lock().remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the reply and always clears the slot afterwards.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, PendingError> {
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.unregister(request_id);
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PendingError::Closed),
            Err(_) => Err(PendingError::Timeout),
        }
    }
}

/// The four correlation tables a node keeps for its wings.
#[derive(Clone)]
pub struct PendingTables {
    pub directory: Arc<PendingLedger<Vec<DirEntry>>>,
    pub session_sync: Arc<PendingLedger<Vec<SessionInfo>>>,
    pub history: Arc<PendingLedger<Vec<Value>>>,
    pub audit: Arc<PendingLedger<Vec<Value>>>,
}

impl Default for PendingTables {
    fn default() -> Self {
        Self {
            directory: Arc::new(PendingLedger::new("directory")),
            session_sync: Arc::new(PendingLedger::new("session_sync")),
            history: Arc::new(PendingLedger::new("history")),
            audit: Arc::new(PendingLedger::new("audit")),
        }
    }
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10)]
    async fn resolve_delivers_once() {
        let ledger = PendingLedger::<u32>::new("test");
        let rx = ledger.register("r-1").unwrap();
        assert!(ledger.resolve("r-1", 7));
        assert!(!ledger.resolve("r-1", 8));
        assert_eq!(rx.await.unwrap(), 7);
        assert!(ledger.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unmatched_and_abandoned_replies_are_dropped() {
        let ledger = PendingLedger::<u32>::new("test");
        assert!(!ledger.resolve("ghost", 1));

        let rx = ledger.register("r-2").unwrap();
        drop(rx);
        assert!(!ledger.resolve("r-2", 1));
        assert!(ledger.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn duplicate_registration_is_rejected() {
        let ledger = PendingLedger::<u32>::new("test");
        let _rx = ledger.register("r-3").unwrap();
        assert_eq!(
            ledger.register("r-3").unwrap_err(),
            PendingError::Duplicate("r-3".into())
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn wait_times_out_and_clears_slot() {
        let ledger = PendingLedger::<u32>::new("test");
        let rx = ledger.register("r-4").unwrap();
        let err = ledger
            .wait("r-4", rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, PendingError::Timeout);
        assert!(ledger.is_empty());
        assert!(!ledger.resolve("r-4", 1));
    }

    #[test_timeout::tokio_timeout_test(10, multi_thread)]
    async fn concurrent_resolvers_deliver_at_most_once() {
        let ledger = Arc::new(PendingLedger::<usize>::new("test"));
        let rx = ledger.register("race").unwrap();
        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move { ledger.resolve("race", i) }));
        }
        let mut delivered = 0;
        for handle in handles {
            if handle.await.unwrap() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert!(rx.await.is_ok());
    }
}
