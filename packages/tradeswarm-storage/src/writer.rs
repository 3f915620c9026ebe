//! Serialized write queue
//!
//! Exactly one writer drains this FIFO queue per store. Callers enqueue a
//! [`WriteRequest`] and suspend on its reply channel until the writer has
//! committed (or rejected) the operation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{Ack, OutputRecord, Session, SessionId, SessionStatus};
use crate::{Result, StorageError};

/// A mutation waiting for the writer
#[derive(Debug)]
pub enum WriteOp {
    Record(OutputRecord),
    CreateSession(Session),
    FinishSession {
        session_id: SessionId,
        status: SessionStatus,
        finished_at: DateTime<Utc>,
    },
    Purge {
        cutoff: DateTime<Utc>,
    },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Record(_) => "record",
            WriteOp::CreateSession(_) => "create_session",
            WriteOp::FinishSession { .. } => "finish_session",
            WriteOp::Purge { .. } => "purge",
        }
    }
}

/// Queued mutation plus the channel its result is delivered on
#[derive(Debug)]
pub struct WriteRequest {
    pub op: WriteOp,
    pub enqueued_at: Instant,
    pub reply: oneshot::Sender<Result<Ack>>,
}

impl WriteRequest {
    /// Deliver the result; a caller that stopped waiting is not an error
    pub fn respond(reply: oneshot::Sender<Result<Ack>>, result: Result<Ack>) {
        if reply.send(result).is_err() {
            tracing::debug!("write caller went away before the ack was delivered");
        }
    }
}

/// Sending half of the writer queue
pub struct WriteQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
}

impl WriteQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WriteRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Enqueue `op` and wait for the writer's answer
    pub async fn submit(&self, op: WriteOp) -> Result<Ack> {
        let (reply, rx) = oneshot::channel();
        let request = WriteRequest {
            op,
            enqueued_at: Instant::now(),
            reply,
        };

        {
            let guard = self.sender.lock();
            let sender = guard.as_ref().ok_or_else(StorageError::writer_closed)?;
            sender
                .send(request)
                .map_err(|_| StorageError::writer_closed())?;
        }

        rx.await.map_err(|_| StorageError::writer_closed())?
    }

    /// Stop accepting writes. Requests already queued are still applied.
    ///
    /// Returns `false` if the queue was already closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }
}
