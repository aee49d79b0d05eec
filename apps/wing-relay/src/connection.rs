use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use wing_proto::RelayMessage;

const DEFAULT_OUTBOUND_DEPTH: usize = 256;

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(RelayMessage),
    /// Acknowledged by the writer once the frame has been written to the socket.
    Tracked(RelayMessage, oneshot::Sender<()>),
    Close(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("write deadline exceeded")]
    Timeout,
    #[error("outbound buffer full")]
    Full,
}

/// Cloneable handle to one open wing connection. Writes go through a bounded
/// queue drained by the connection's writer task, so a caller never touches
/// the socket directly and never waits longer than its own deadline.
#[derive(Clone, Debug)]
pub struct WingHandle {
    tx: mpsc::Sender<Outbound>,
}

impl WingHandle {
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_depth(DEFAULT_OUTBOUND_DEPTH)
    }

    pub fn with_depth(depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, message: RelayMessage, deadline: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(deadline, self.tx.send(Outbound::Message(message))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Like [`send`](Self::send), but only succeeds once the writer has put the
    /// frame on the wire. A frame still queued when the deadline passes, or
    /// dropped with the connection, reports an error.
    pub async fn deliver(&self, message: RelayMessage, deadline: Duration) -> Result<(), SendError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let written = async {
            self.tx
                .send(Outbound::Tracked(message, ack_tx))
                .await
                .map_err(|_| SendError::Closed)?;
            ack_rx.await.map_err(|_| SendError::Closed)
        };
        match tokio::time::timeout(deadline, written).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Used from the read loop where waiting would stall the wing's control channel.
    pub fn try_send(&self, message: RelayMessage) -> Result<(), SendError> {
        self.tx
            .try_send(Outbound::Message(message))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    pub async fn close(&self, reason: impl Into<String>, deadline: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(deadline, self.tx.send(Outbound::Close(reason.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
